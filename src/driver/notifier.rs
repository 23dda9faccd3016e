//! Out-of-band channel from a driver back to the scheduler.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::TaskId;
use crate::scheduler::gate::{SubmissionGate, SubmissionGuard};

/// Notices a driver may send without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverNotice {
    /// A solution for the task's current run reached the provider.
    SolutionSubmitted(TaskId),
    /// The provider throttled a call the scheduler did not issue.
    Throttled(TaskId),
}

/// Handed to [`TaskDriver::launch`](super::TaskDriver::launch).
#[derive(Debug, Clone)]
pub struct DriverNotifier {
    tx: mpsc::UnboundedSender<DriverNotice>,
    gate: Arc<SubmissionGate>,
}

impl DriverNotifier {
    pub fn new(tx: mpsc::UnboundedSender<DriverNotice>, gate: Arc<SubmissionGate>) -> Self {
        Self { tx, gate }
    }

    /// Hold the returned guard for the duration of a submission request;
    /// polling waits behind it.
    pub fn begin_submission(&self, task_id: TaskId) -> SubmissionGuard {
        self.gate.begin_submission(task_id)
    }

    pub fn solution_submitted(&self, task_id: TaskId) {
        self.send(DriverNotice::SolutionSubmitted(task_id));
    }

    pub fn throttled(&self, task_id: TaskId) {
        self.send(DriverNotice::Throttled(task_id));
    }

    fn send(&self, notice: DriverNotice) {
        // The scheduler may already be stopped; nothing left to tell.
        if self.tx.send(notice).is_err() {
            log::debug!("Driver notice dropped, scheduler not listening");
        }
    }
}
