//! Submission-over-polling priority gate.
//!
//! While a submission is in flight for any task, polling-class calls wait
//! (up to a bounded time) for it to resolve. Unrelated tasks' polls are not
//! serialized against each other. The gate also owns the per-task polling
//! interval, which widens under throttling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};

use crate::config::PacingConfig;
use crate::domain::TaskId;
use crate::scheduler::limiter::AdaptiveInterval;

/// What happened when a poll asked for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// No submission in flight.
    Clear,
    /// Waited for in-flight submissions to resolve.
    Waited(Duration),
    /// Gave up waiting and proceeded anyway.
    TimedOut(Duration),
}

#[derive(Debug)]
struct PollState {
    interval: AdaptiveInterval,
    last_polled: HashMap<TaskId, Instant>,
}

/// Priority gate between submission-class and polling-class calls.
#[derive(Debug)]
pub struct SubmissionGate {
    in_flight: watch::Sender<usize>,
    max_wait: Duration,
    polls: Mutex<PollState>,
}

impl SubmissionGate {
    pub fn new(config: &PacingConfig) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            in_flight,
            max_wait: config.submission_max_wait(),
            polls: Mutex::new(PollState {
                interval: AdaptiveInterval::new(&config.polling),
                last_polled: HashMap::new(),
            }),
        }
    }

    /// Mark a submission in flight until the returned guard is dropped.
    pub fn begin_submission(self: &Arc<Self>, task_id: TaskId) -> SubmissionGuard {
        self.in_flight.send_modify(|n| *n += 1);
        tracing::debug!(task_id, "Submission started, polling suspended");
        SubmissionGuard {
            gate: Arc::clone(self),
            task_id,
        }
    }

    pub fn submissions_in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Block a poll until no submission is in flight, bounded by the max wait.
    pub async fn wait_for_poll_slot(&self) -> GateOutcome {
        let mut rx = self.in_flight.subscribe();
        if *rx.borrow_and_update() == 0 {
            return GateOutcome::Clear;
        }

        let started = Instant::now();
        match tokio::time::timeout(self.max_wait, rx.wait_for(|n| *n == 0)).await {
            Ok(_) => GateOutcome::Waited(started.elapsed()),
            Err(_) => {
                tracing::warn!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    in_flight = self.submissions_in_flight(),
                    "Submission still in flight, polling anyway"
                );
                GateOutcome::TimedOut(started.elapsed())
            }
        }
    }

    /// Whether `task_id` is due for a poll; records the poll if so.
    pub async fn should_poll(&self, task_id: TaskId) -> bool {
        let mut polls = self.polls.lock().await;
        let interval = polls.interval.current();
        let due = polls
            .last_polled
            .get(&task_id)
            .is_none_or(|last| last.elapsed() >= interval);
        if due {
            polls.last_polled.insert(task_id, Instant::now());
        }
        due
    }

    /// Forget a task's poll history so its next poll is immediately due.
    pub async fn forget(&self, task_id: TaskId) {
        self.polls.lock().await.last_polled.remove(&task_id);
    }

    pub async fn record_throttled(&self) {
        let mut polls = self.polls.lock().await;
        let interval = polls.interval.escalate();
        tracing::warn!(interval_ms = interval.as_millis() as u64, "Polling throttled, widening interval");
    }

    pub async fn record_success(&self) {
        let mut polls = self.polls.lock().await;
        if polls.interval.relax() {
            tracing::info!(
                interval_ms = polls.interval.current().as_millis() as u64,
                "Polling interval relaxed"
            );
        }
    }

    pub async fn poll_interval(&self) -> Duration {
        self.polls.lock().await.interval.current()
    }
}

/// Keeps a submission marked in flight for as long as it lives.
#[derive(Debug)]
pub struct SubmissionGuard {
    gate: Arc<SubmissionGate>,
    task_id: TaskId,
}

impl SubmissionGuard {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        self.gate.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        tracing::debug!(task_id = self.task_id, "Submission resolved");
    }
}
