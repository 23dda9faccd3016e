//! Navigation pacing.
//!
//! Every navigation-class driver call (session open, clicks, reload) passes
//! through one [`RateLimiter`] queue. The limiter enforces a minimum spacing
//! between calls; the spacing is multiplied up on each throttling signal and
//! stepped back toward its base once the provider has been quiet for a
//! recovery window.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::IntervalConfig;

/// An interval that escalates under throttling and relaxes after quiet periods.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    base: Duration,
    max: Duration,
    multiplier: f64,
    recovery: Duration,
    current: Duration,
    /// Last throttle or last relax step, whichever is later.
    quiet_since: Option<Instant>,
}

impl AdaptiveInterval {
    pub fn new(config: &IntervalConfig) -> Self {
        Self {
            base: config.base(),
            max: config.max().max(config.base()),
            multiplier: config.multiplier.max(1.0),
            recovery: config.recovery(),
            current: config.base(),
            quiet_since: None,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn is_escalated(&self) -> bool {
        self.current > self.base
    }

    /// Multiply the interval up (capped) and restart the quiet window.
    pub fn escalate(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        self.quiet_since = Some(Instant::now());
        self.current
    }

    /// Step one notch back toward base if the quiet window has elapsed.
    ///
    /// Returns true if the interval changed.
    pub fn relax(&mut self) -> bool {
        if !self.is_escalated() {
            return false;
        }
        let quiet_long_enough = self.quiet_since.is_none_or(|t| t.elapsed() >= self.recovery);
        if !quiet_long_enough {
            return false;
        }
        self.current = self.current.div_f64(self.multiplier).max(self.base);
        self.quiet_since = Some(Instant::now());
        true
    }
}

#[derive(Debug)]
struct LimiterState {
    interval: AdaptiveInterval,
    last_call: Option<Instant>,
}

/// Serializing minimum-interval gate for navigation-class calls.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: &IntervalConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                interval: AdaptiveInterval::new(config),
                last_call: None,
            }),
        }
    }

    /// Wait for this caller's turn.
    ///
    /// The queue lock is held while sleeping, so callers are released one at
    /// a time, in arrival order, at least `interval` apart.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_call {
            let wait = state.interval.current().saturating_sub(last.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        state.last_call = Some(Instant::now());
    }

    pub async fn record_throttled(&self) {
        let mut state = self.state.lock().await;
        let interval = state.interval.escalate();
        tracing::warn!(interval_ms = interval.as_millis() as u64, "Navigation throttled, widening interval");
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if state.interval.relax() {
            tracing::info!(
                interval_ms = state.interval.current().as_millis() as u64,
                "Navigation interval relaxed"
            );
        }
    }

    pub async fn current_interval(&self) -> Duration {
        self.state.lock().await.interval.current()
    }
}
