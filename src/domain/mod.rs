//! Domain types for minerd
//!
//! - Task: one unit of mining work and its state machine
//! - TaskTable: the ordered in-memory table of all tasks
//! - Stats: counters and latency samples for reporting

pub mod stats;
pub mod table;
pub mod task;

pub use stats::{MAX_LATENCY_SAMPLES, Stats};
pub use table::{StatusCounts, TaskTable};
pub use task::{Task, TaskId, TaskStatus};
