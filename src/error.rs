//! Error types for minerd
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};
use crate::driver::DriverError;

/// All error types that can surface from the scheduler library
#[derive(Debug, Error)]
pub enum MinerError {
    /// Task not present in the task table
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A status change that is not an edge of the task state machine
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: TaskId, from: TaskStatus, to: TaskStatus },

    /// Start() called on a scheduler that is already running or starting
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Stop() or a runtime operation called on a stopped scheduler
    #[error("Scheduler is not running")]
    NotRunning,

    /// The actor panicked and its mailbox was lost; the scheduler cannot restart
    #[error("Scheduler actor terminated abnormally")]
    ActorLost,

    /// The shared driver resource could not be acquired
    #[error("Driver launch failed: {0}")]
    DriverLaunch(#[source] DriverError),

    /// Configuration is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for minerd operations
pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_not_found_error() {
        let err = MinerError::TaskNotFound(7);
        assert_eq!(err.to_string(), "Task not found: 7");
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = MinerError::InvalidTransition {
            id: 3,
            from: TaskStatus::Closed,
            to: TaskStatus::Mining,
        };
        assert_eq!(err.to_string(), "Invalid transition for task 3: closed -> mining");
    }

    #[test]
    fn test_driver_launch_error() {
        let err = MinerError::DriverLaunch(DriverError::Failed("no browser".to_string()));
        assert_eq!(err.to_string(), "Driver launch failed: Driver failure: no browser");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MinerError = io_err.into();
        assert!(matches!(err, MinerError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{not: a list").unwrap_err();
        let err: MinerError = yaml_err.into();
        assert!(matches!(err, MinerError::Yaml(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(MinerError::NotRunning)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
