//! Task Driver - the session automation layer the scheduler consumes
//!
//! The scheduler never knows how a session is opened or how its status is
//! derived. It only sees the primitives of [`TaskDriver`]:
//! - session lifecycle (`initialize_session`, `dispose`)
//! - side-effect-free probes (`detect_status`, `check_health`)
//! - actions (`click_start`, `click_stop`, `reload`)
//!
//! Drivers report out-of-band events (solution submitted, throttling seen
//! during a submission) through the [`DriverNotifier`] handed to `launch`.

pub mod mock;
pub mod notifier;
pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TaskId;

pub use mock::MockDriver;
pub use notifier::{DriverNotice, DriverNotifier};
pub use sim::SimulatedDriver;

/// Live handle to a driver-side session
///
/// Clones share the closed flag, so a driver can mark a session closed
/// (page closed underneath us) and the scheduler observes it on its next scan.
#[derive(Clone)]
pub struct SessionHandle {
    task_id: TaskId,
    id: String,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Create an open handle
    pub fn new(task_id: TaskId, id: impl Into<String>) -> Self {
        Self {
            task_id,
            id: id.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("task_id", &self.task_id)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Status reported by a side-effect-free probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedStatus {
    /// Session lost its login; the task must be re-admitted
    Pending,
    /// Still loading, start control not yet visible
    Initializing,
    /// Start control visible, not yet activated
    StartReady,
    /// Timed mining phase running
    Mining,
    /// Completion signal visible
    Completed,
    /// Provider throttling page shown instead of content
    Throttled,
    /// Page or renderer crashed
    Crashed,
    /// Driver-internal problem; state is preserved
    Error(String),
}

impl DetectedStatus {
    /// A state the health monitor can adopt after a reload
    pub fn is_recognized(&self) -> bool {
        matches!(
            self,
            DetectedStatus::StartReady | DetectedStatus::Mining | DetectedStatus::Completed
        )
    }
}

/// Liveness signal from a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    Crashed,
    /// Blank content
    Empty,
    /// None of the expected status markers present, or no answer in time
    Unresponsive,
}

impl SessionHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, SessionHealth::Healthy)
    }
}

/// Errors returned by driver operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Throttled by provider, retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    #[error("Session closed")]
    SessionClosed,

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Driver failure: {0}")]
    Failed(String),
}

impl DriverError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, DriverError::Throttled { .. })
    }
}

/// Session lifecycle primitives consumed by the scheduler
#[async_trait]
pub trait TaskDriver: Send + Sync {
    /// Acquire the shared underlying resource (browser, connection pool).
    /// Failure here is the only fatal error in the system.
    async fn launch(&self, notifier: DriverNotifier) -> Result<(), DriverError>;

    /// Drive a fresh session to the point where the start control is present
    async fn initialize_session(&self, task_id: TaskId, address: &str) -> Result<SessionHandle, DriverError>;

    /// Idempotent probe of the session's current status
    async fn detect_status(&self, handle: &SessionHandle) -> DetectedStatus;

    async fn click_start(&self, handle: &SessionHandle) -> Result<(), DriverError>;

    async fn click_stop(&self, handle: &SessionHandle) -> Result<(), DriverError>;

    async fn check_health(&self, handle: &SessionHandle) -> SessionHealth;

    async fn reload(&self, handle: &SessionHandle) -> Result<(), DriverError>;

    /// Release the session's resources; never fails
    async fn dispose(&self, handle: &SessionHandle);

    /// Release the shared resource acquired by `launch`
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_clones_share_closed_flag() {
        let handle = SessionHandle::new(3, "ses-3");
        let clone = handle.clone();
        assert!(!clone.is_closed());
        handle.mark_closed();
        assert!(clone.is_closed());
        assert_eq!(clone.task_id(), 3);
        assert_eq!(clone.id(), "ses-3");
    }

    #[test]
    fn test_recognized_statuses() {
        assert!(DetectedStatus::Mining.is_recognized());
        assert!(DetectedStatus::StartReady.is_recognized());
        assert!(DetectedStatus::Completed.is_recognized());
        assert!(!DetectedStatus::Initializing.is_recognized());
        assert!(!DetectedStatus::Crashed.is_recognized());
    }

    #[test]
    fn test_driver_error_throttled() {
        assert!(DriverError::Throttled { retry_after: None }.is_throttled());
        assert!(!DriverError::SessionClosed.is_throttled());
        assert_eq!(DriverError::Timeout("click_start").to_string(), "Timed out: click_start");
    }
}
