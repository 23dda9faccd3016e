//! Admission circuit breaker.
//!
//! When session opens keep coming back throttled, admitting more tasks only
//! feeds the provider's burst detector. This module counts consecutive
//! throttled admissions and, past a threshold, pauses admission for a fixed
//! cooldown. Any clean success or a cycle reset closes the breaker.

use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

/// Process-wide rate limit state owned by the scheduler.
#[derive(Debug)]
pub struct RateLimitState {
    /// Consecutive throttling signals seen by admission.
    pub consecutive_throttled: u32,
    /// When the last throttling signal arrived.
    pub last_throttled_at: Option<Instant>,
    /// Admission is a no-op until this instant.
    pub pause_until: Option<Instant>,
    max_consecutive: u32,
    cooldown: Duration,
}

impl RateLimitState {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            consecutive_throttled: 0,
            last_throttled_at: None,
            pause_until: None,
            max_consecutive: config.max_consecutive.max(1),
            cooldown: config.cooldown(),
        }
    }

    /// Check if admission is currently paused.
    pub fn is_paused(&self) -> bool {
        self.pause_until.is_some_and(|until| Instant::now() < until)
    }

    /// Get remaining pause duration if paused.
    pub fn remaining_pause(&self) -> Option<Duration> {
        self.pause_until.and_then(|until| {
            let now = Instant::now();
            if now < until { Some(until - now) } else { None }
        })
    }

    /// Record a throttled admission.
    ///
    /// Returns true if this signal tripped (or re-armed) the breaker.
    pub fn record_throttled(&mut self) -> bool {
        self.consecutive_throttled += 1;
        self.last_throttled_at = Some(Instant::now());

        if self.consecutive_throttled < self.max_consecutive {
            tracing::warn!(
                consecutive = self.consecutive_throttled,
                threshold = self.max_consecutive,
                "Admission throttled"
            );
            return false;
        }

        self.pause_until = Some(Instant::now() + self.cooldown);
        tracing::warn!(
            consecutive = self.consecutive_throttled,
            cooldown_secs = self.cooldown.as_secs(),
            "Admission circuit breaker tripped, pausing new sessions"
        );
        true
    }

    /// Record a clean success; closes the breaker.
    pub fn record_success(&mut self) {
        if self.consecutive_throttled > 0 || self.pause_until.is_some() {
            tracing::info!("Admission circuit breaker reset after success");
        }
        self.consecutive_throttled = 0;
        self.pause_until = None;
    }

    /// Reset everything, including the last-throttled timestamp.
    pub fn reset(&mut self) {
        self.consecutive_throttled = 0;
        self.last_throttled_at = None;
        self.pause_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(max_consecutive: u32, cooldown_ms: u64) -> RateLimitState {
        RateLimitState::new(&BreakerConfig {
            max_consecutive,
            cooldown_ms,
        })
    }

    #[test]
    fn test_new_state_is_closed() {
        let state = breaker(3, 1_000);
        assert!(!state.is_paused());
        assert_eq!(state.consecutive_throttled, 0);
        assert!(state.remaining_pause().is_none());
    }

    #[test]
    fn test_trips_at_threshold() {
        let mut state = breaker(3, 60_000);
        assert!(!state.record_throttled());
        assert!(!state.record_throttled());
        assert!(!state.is_paused());
        assert!(state.record_throttled());
        assert!(state.is_paused());
    }

    #[test]
    fn test_four_signals_with_threshold_three_pause() {
        let mut state = breaker(3, 60_000);
        for _ in 0..4 {
            state.record_throttled();
        }
        assert!(state.is_paused());
        assert_eq!(state.consecutive_throttled, 4);
        assert!(state.remaining_pause().unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn test_success_closes_breaker() {
        let mut state = breaker(1, 60_000);
        state.record_throttled();
        assert!(state.is_paused());
        state.record_success();
        assert!(!state.is_paused());
        assert_eq!(state.consecutive_throttled, 0);
        // The timestamp is kept for reporting
        assert!(state.last_throttled_at.is_some());
    }

    #[test]
    fn test_pause_expires() {
        let mut state = breaker(1, 10);
        state.record_throttled();
        assert!(state.is_paused());
        thread::sleep(Duration::from_millis(20));
        assert!(!state.is_paused());
    }

    #[test]
    fn test_reset() {
        let mut state = breaker(1, 60_000);
        state.record_throttled();
        state.reset();
        assert!(!state.is_paused());
        assert!(state.last_throttled_at.is_none());
    }
}
