//! Task file loading.
//!
//! A task file is a YAML list:
//!
//! ```yaml
//! - id: 0
//!   address: addr_test1qz...
//! - id: 1
//!   address: addr_test1qx...
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::Deserialize;

use minerd::domain::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub address: String,
}

/// Parse a task file, rejecting duplicate ids and blank addresses
pub fn load_tasks(path: &Path) -> Result<Vec<TaskEntry>> {
    let content = fs::read_to_string(path).context(format!("Failed to read task file {}", path.display()))?;
    parse_tasks(&content).context(format!("Invalid task file {}", path.display()))
}

pub fn parse_tasks(content: &str) -> Result<Vec<TaskEntry>> {
    let entries: Vec<TaskEntry> = serde_yaml::from_str(content).context("Failed to parse task list")?;

    let mut seen = HashSet::new();
    for entry in &entries {
        if entry.address.trim().is_empty() {
            eyre::bail!("task {} has an empty address", entry.id);
        }
        if !seen.insert(entry.id) {
            eyre::bail!("duplicate task id {}", entry.id);
        }
    }
    Ok(entries)
}
