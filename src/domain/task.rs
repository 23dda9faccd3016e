//! Task record and its state machine
//!
//! A Task is one unit of mining work bound to an address. Its status moves
//! only along the edges accepted by [`TaskStatus::can_transition_to`]; every
//! mutation goes through [`Task::transition`].

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::SessionHandle;
use crate::error::{MinerError, Result};

/// Stable task identifier. Admission walks pending tasks in ascending id order.
pub type TaskId = u64;

/// Status of a task's mining session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for admission
    Pending,
    /// Admitted; session opening or waiting for the start control
    Initializing,
    /// Timed mining phase running
    Mining,
    /// Driver reported completion, session still open
    Completed,
    /// Session disposal in progress
    WaitingClose,
    /// Finished for this cycle
    Closed,
    /// Quarantined until the error sweep returns it to Pending
    Error,
}

impl TaskStatus {
    /// All statuses, in declaration order
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Initializing,
        TaskStatus::Mining,
        TaskStatus::Completed,
        TaskStatus::WaitingClose,
        TaskStatus::Closed,
        TaskStatus::Error,
    ];

    /// Statuses in which the task may own a session handle
    pub fn owns_session(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Closed | TaskStatus::Error)
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// Initializing's self-loop (a counted start click) is not a status change
    /// and is recorded with [`Task::record_start_click`] instead.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, to) {
            // crash exhaustion / stuck init, and init failure / resets / sweeps
            (from, Error) => from != Error,
            (_, Pending) => true,
            (Pending, Initializing) => true,
            (Initializing, Mining) | (Initializing, Completed) => true,
            (Mining, Completed) | (Mining, Initializing) | (Mining, Closed) => true,
            (Completed, WaitingClose) | (Completed, Closed) | (WaitingClose, Closed) => true,
            _ => false,
        }
    }

    /// Lowercase label used in logs and snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Initializing => "initializing",
            TaskStatus::Mining => "mining",
            TaskStatus::Completed => "completed",
            TaskStatus::WaitingClose => "waiting_close",
            TaskStatus::Closed => "closed",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry per unit of work
#[derive(Debug, Clone)]
pub struct Task {
    //=== Identity ===
    pub id: TaskId,
    /// Opaque parameter handed to the driver
    pub address: String,

    //=== State ===
    pub status: TaskStatus,
    /// Last time `status` actually changed; start clicks do not touch it
    pub status_changed_at: Instant,
    /// Owned while status is not Pending/Closed/Error
    pub session: Option<SessionHandle>,
    /// Bumped on every promotion and reset so late async results can be recognized
    pub generation: u64,
    pub last_error: Option<String>,

    //=== Stuck-initialization tracking ===
    pub start_click_count: u32,
    pub last_start_click_at: Option<Instant>,

    //=== Crash-refresh tracking ===
    pub crash_refresh_count: u32,
    pub last_crash_refresh_at: Option<Instant>,

    //=== Cycle binding ===
    pub mining_cycle: Option<u64>,
    pub mining_cycle_started_at: Option<DateTime<Utc>>,
    pub completed_in_cycle: Option<u64>,
    pub submitted_solution: bool,

    //=== Latency sampling ===
    pub init_started_at: Option<Instant>,
    pub mining_started_at: Option<Instant>,

    //=== Timestamps ===
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task
    pub fn new(id: TaskId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            status: TaskStatus::Pending,
            status_changed_at: Instant::now(),
            session: None,
            generation: 0,
            last_error: None,
            start_click_count: 0,
            last_start_click_at: None,
            crash_refresh_count: 0,
            last_crash_refresh_at: None,
            mining_cycle: None,
            mining_cycle_started_at: None,
            completed_in_cycle: None,
            submitted_solution: false,
            init_started_at: None,
            mining_started_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to `to`, rejecting anything that is not a state-machine edge.
    ///
    /// Returns the previous status.
    pub fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(MinerError::InvalidTransition { id: self.id, from, to });
        }
        self.status = to;
        self.status_changed_at = Instant::now();
        Ok(from)
    }

    /// True when the task holds a handle the driver has not closed
    pub fn has_open_session(&self) -> bool {
        self.session.as_ref().is_some_and(|h| !h.is_closed())
    }

    /// Counts toward the open-page ceiling.
    ///
    /// Initializing always counts, handle or not: capacity is reserved the
    /// instant a task is promoted.
    pub fn counts_as_open_page(&self) -> bool {
        self.status == TaskStatus::Initializing || (self.status.owns_session() && self.has_open_session())
    }

    /// Mining with a confirmed-open handle
    pub fn is_actively_mining(&self) -> bool {
        self.status == TaskStatus::Mining && self.has_open_session()
    }

    /// Initializing with a ready session (init finished)
    pub fn is_session_ready(&self) -> bool {
        self.status == TaskStatus::Initializing && self.has_open_session()
    }

    /// Admit the task: Pending -> Initializing, starting a new mining run
    pub fn promote(&mut self) -> Result<()> {
        self.transition(TaskStatus::Initializing)?;
        self.generation += 1;
        self.session = None;
        self.last_error = None;
        self.start_click_count = 0;
        self.last_start_click_at = None;
        self.crash_refresh_count = 0;
        self.last_crash_refresh_at = None;
        self.submitted_solution = false;
        self.init_started_at = Some(Instant::now());
        self.mining_started_at = None;
        Ok(())
    }

    /// Record an issued start click (Initializing self-loop)
    pub fn record_start_click(&mut self) {
        self.start_click_count += 1;
        self.last_start_click_at = Some(Instant::now());
    }

    /// Initializing -> Mining, binding the run to `cycle` if not yet bound
    pub fn begin_mining(&mut self, cycle: u64) -> Result<()> {
        self.transition(TaskStatus::Mining)?;
        if self.mining_cycle.is_none() {
            self.mining_cycle = Some(cycle);
            self.mining_cycle_started_at = Some(Utc::now());
        }
        self.mining_started_at = Some(Instant::now());
        Ok(())
    }

    /// Initializing|Mining -> Completed
    pub fn complete(&mut self, cycle: u64) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.completed_in_cycle = Some(cycle);
        Ok(())
    }

    /// Detach the session handle, leaving disposal to the caller
    pub fn take_session(&mut self) -> Option<SessionHandle> {
        self.session.take()
    }

    /// Return to Pending, releasing the handle. Used for init failure,
    /// recovery sweeps and ceiling self-heal; per-cycle fields are kept.
    pub fn requeue(&mut self, reason: Option<String>) -> Option<SessionHandle> {
        self.status = TaskStatus::Pending;
        self.status_changed_at = Instant::now();
        self.generation += 1;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.start_click_count = 0;
        self.last_start_click_at = None;
        self.init_started_at = None;
        self.mining_started_at = None;
        self.mining_cycle = None;
        self.mining_cycle_started_at = None;
        self.session.take()
    }

    /// Return to Pending with every per-cycle field cleared
    pub fn reset_for_cycle(&mut self) -> Option<SessionHandle> {
        let handle = self.requeue(None);
        self.last_error = None;
        self.crash_refresh_count = 0;
        self.last_crash_refresh_at = None;
        self.completed_in_cycle = None;
        self.submitted_solution = false;
        handle
    }

    /// Quarantine the task in Error
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Error)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_handle(task_id: TaskId) -> SessionHandle {
        SessionHandle::new(task_id, format!("ses-{}", task_id))
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(1, "addr1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.session.is_none());
        assert!(!task.submitted_solution);
        assert_eq!(task.generation, 0);
    }

    #[test]
    fn test_allowed_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Mining));
        assert!(Initializing.can_transition_to(Completed));
        assert!(Mining.can_transition_to(Completed));
        assert!(Mining.can_transition_to(Initializing));
        assert!(Mining.can_transition_to(Closed));
        assert!(Completed.can_transition_to(WaitingClose));
        assert!(WaitingClose.can_transition_to(Closed));
        assert!(Error.can_transition_to(Pending));
        assert!(Mining.can_transition_to(Error));
        assert!(Initializing.can_transition_to(Pending));
    }

    #[test]
    fn test_rejected_edges() {
        use TaskStatus::*;
        assert!(!Closed.can_transition_to(Initializing));
        assert!(!Closed.can_transition_to(Mining));
        assert!(!Pending.can_transition_to(Mining));
        assert!(!Error.can_transition_to(Initializing));
        assert!(!Error.can_transition_to(Error));
        assert!(!Initializing.can_transition_to(Closed));
        assert!(!Completed.can_transition_to(Mining));
    }

    #[test]
    fn test_transition_rejects_invalid_edge() {
        let mut task = Task::new(1, "addr");
        let err = task.transition(TaskStatus::Mining).unwrap_err();
        assert!(matches!(err, MinerError::InvalidTransition { id: 1, .. }));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_promote_starts_new_run() {
        let mut task = Task::new(1, "addr");
        task.submitted_solution = true;
        task.crash_refresh_count = 2;
        task.promote().unwrap();
        assert_eq!(task.status, TaskStatus::Initializing);
        assert_eq!(task.generation, 1);
        assert!(!task.submitted_solution);
        assert_eq!(task.crash_refresh_count, 0);
        assert!(task.init_started_at.is_some());
    }

    #[test]
    fn test_initializing_counts_as_open_page_without_handle() {
        let mut task = Task::new(1, "addr");
        assert!(!task.counts_as_open_page());
        task.promote().unwrap();
        assert!(task.session.is_none());
        assert!(task.counts_as_open_page());
    }

    #[test]
    fn test_closed_handle_not_counted_while_mining() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        let handle = open_handle(1);
        task.session = Some(handle.clone());
        task.begin_mining(0).unwrap();
        assert!(task.counts_as_open_page());
        assert!(task.is_actively_mining());

        handle.mark_closed();
        assert!(!task.counts_as_open_page());
        assert!(!task.is_actively_mining());
    }

    #[test]
    fn test_begin_mining_keeps_existing_cycle() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        task.begin_mining(4).unwrap();
        assert_eq!(task.mining_cycle, Some(4));

        task.transition(TaskStatus::Initializing).unwrap();
        task.begin_mining(5).unwrap();
        assert_eq!(task.mining_cycle, Some(4));
    }

    #[test]
    fn test_complete_records_cycle() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        task.begin_mining(2).unwrap();
        task.complete(2).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_in_cycle, Some(2));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_requeue_releases_handle() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        task.session = Some(open_handle(1));
        let generation = task.generation;

        let released = task.requeue(Some("init failed".to_string()));
        assert!(released.is_some());
        assert!(task.session.is_none());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.as_deref(), Some("init failed"));
        assert!(task.generation > generation);
    }

    #[test]
    fn test_reset_for_cycle_clears_cycle_fields() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        task.begin_mining(1).unwrap();
        task.complete(1).unwrap();
        task.submitted_solution = true;

        task.reset_for_cycle();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.mining_cycle.is_none());
        assert!(task.completed_in_cycle.is_none());
        assert!(!task.submitted_solution);
    }

    #[test]
    fn test_start_clicks_do_not_count_as_status_change() {
        let mut task = Task::new(1, "addr1");
        task.promote().unwrap();
        let promoted_at = task.status_changed_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        task.record_start_click();
        task.record_start_click();
        assert_eq!(task.status_changed_at, promoted_at);

        task.session = Some(open_handle(1));
        task.begin_mining(0).unwrap();
        assert!(task.status_changed_at > promoted_at);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut task = Task::new(1, "addr");
        task.promote().unwrap();
        task.fail("page crashed").unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.last_error.as_deref(), Some("page crashed"));
        assert!(task.fail("again").is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::WaitingClose.to_string(), "waiting_close");
        assert_eq!(TaskStatus::Mining.to_string(), "mining");
    }
}
