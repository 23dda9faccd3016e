//! ID generation utilities for minerd
//!
//! Provides timestamps and identifiers for driver sessions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::TaskId;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique session ID for a task
///
/// Format: `ses-{task_id}-{timestamp_ms}-{seq:04x}`
/// Example: `ses-3-1738300800123-000a`
pub fn generate_session_id(task_id: TaskId) -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("ses-{}-{}-{:04x}", task_id, now_ms(), seq)
}
