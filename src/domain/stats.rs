//! Scheduler statistics.
//!
//! Counters are monotonic except the per-cycle solution counter, which the
//! cycle manager clears on rollover. Nothing here gates behavior.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of latency samples retained per series.
pub const MAX_LATENCY_SAMPLES: usize = 200;

/// Monotonic counters plus bounded latency samples.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Tasks closed after a completion signal.
    pub success: u64,
    /// Init failures, stuck/crash promotions to Error, health-check resets.
    pub failed: u64,
    /// Solutions credited across all cycles.
    pub submitted_solutions: u64,
    /// Solutions credited in the current cycle.
    pub submitted_in_cycle: u64,
    /// Session-open latencies (promotion to session ready).
    pub login_latencies: VecDeque<Duration>,
    /// Mining latencies (mining start to completion).
    pub mining_latencies: VecDeque<Duration>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_solution(&mut self) {
        self.submitted_solutions += 1;
        self.submitted_in_cycle += 1;
    }

    pub fn record_login_latency(&mut self, latency: Duration) {
        push_sample(&mut self.login_latencies, latency);
    }

    pub fn record_mining_latency(&mut self, latency: Duration) {
        push_sample(&mut self.mining_latencies, latency);
    }

    /// Clear per-cycle counters; cumulative counters are untouched.
    pub fn reset_cycle(&mut self) {
        self.submitted_in_cycle = 0;
    }

    pub fn avg_login_latency(&self) -> Option<Duration> {
        average(&self.login_latencies)
    }

    pub fn avg_mining_latency(&self) -> Option<Duration> {
        average(&self.mining_latencies)
    }
}

fn push_sample(samples: &mut VecDeque<Duration>, value: Duration) {
    if samples.len() == MAX_LATENCY_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(value);
}

fn average(samples: &VecDeque<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = Stats::new();
        stats.record_success();
        stats.record_failure();
        stats.record_failure();
        stats.record_solution();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.submitted_solutions, 1);
        assert_eq!(stats.submitted_in_cycle, 1);
    }

    #[test]
    fn test_reset_cycle_keeps_cumulative() {
        let mut stats = Stats::new();
        stats.record_solution();
        stats.record_solution();
        stats.reset_cycle();
        assert_eq!(stats.submitted_in_cycle, 0);
        assert_eq!(stats.submitted_solutions, 2);
    }

    #[test]
    fn test_latency_average() {
        let mut stats = Stats::new();
        assert!(stats.avg_login_latency().is_none());
        stats.record_login_latency(Duration::from_millis(100));
        stats.record_login_latency(Duration::from_millis(300));
        assert_eq!(stats.avg_login_latency(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_latency_samples_bounded() {
        let mut stats = Stats::new();
        for i in 0..(MAX_LATENCY_SAMPLES + 10) {
            stats.record_mining_latency(Duration::from_millis(i as u64));
        }
        assert_eq!(stats.mining_latencies.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(stats.mining_latencies.front(), Some(&Duration::from_millis(10)));
    }
}
