//! Task table - the scheduler's in-memory record of every task
//!
//! Ordered by id so admission naturally walks pending tasks ascending.

use std::collections::BTreeMap;

use crate::domain::task::{Task, TaskId, TaskStatus};

/// Per-status task counts
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub initializing: usize,
    pub mining: usize,
    pub completed: usize,
    pub waiting_close: usize,
    pub closed: usize,
    pub error: usize,
}

impl StatusCounts {
    /// Count for a single status
    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Initializing => self.initializing,
            TaskStatus::Mining => self.mining,
            TaskStatus::Completed => self.completed,
            TaskStatus::WaitingClose => self.waiting_close,
            TaskStatus::Closed => self.closed,
            TaskStatus::Error => self.error,
        }
    }

    fn bump(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Initializing => &mut self.initializing,
            TaskStatus::Mining => &mut self.mining,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::WaitingClose => &mut self.waiting_close,
            TaskStatus::Closed => &mut self.closed,
            TaskStatus::Error => &mut self.error,
        };
        *slot += 1;
    }

    /// Total number of tasks counted
    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// All tasks known to the scheduler
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task; returns false if the id is already present
    pub fn insert(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id, task);
        true
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    /// Ids with the given status, ascending
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    /// Number of tasks with the given status
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Per-status counts
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            counts.bump(task.status);
        }
        counts
    }

    /// Drop handle references the driver has already closed.
    ///
    /// Returns the ids whose handle was cleared.
    pub fn clear_closed_handles(&mut self) -> Vec<TaskId> {
        let mut cleared = Vec::new();
        for task in self.tasks.values_mut() {
            if task.session.as_ref().is_some_and(|h| h.is_closed()) {
                task.session = None;
                cleared.push(task.id);
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SessionHandle;

    fn table_with(n: u64) -> TaskTable {
        let mut table = TaskTable::new();
        for id in 0..n {
            table.insert(Task::new(id, format!("addr{}", id)));
        }
        table
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut table = TaskTable::new();
        assert!(table.insert(Task::new(1, "a")));
        assert!(!table.insert(Task::new(1, "b")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1).unwrap().address, "a");
    }

    #[test]
    fn test_ids_with_status_ascending() {
        let mut table = TaskTable::new();
        for id in [5, 2, 9, 1] {
            table.insert(Task::new(id, "a"));
        }
        assert_eq!(table.ids_with_status(TaskStatus::Pending), vec![1, 2, 5, 9]);
    }

    #[test]
    fn test_counts() {
        let mut table = table_with(4);
        table.get_mut(0).unwrap().promote().unwrap();
        table.get_mut(1).unwrap().promote().unwrap();
        table.get_mut(1).unwrap().begin_mining(0).unwrap();

        let counts = table.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.initializing, 1);
        assert_eq!(counts.mining, 1);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.get(TaskStatus::Mining), 1);
    }

    #[test]
    fn test_clear_closed_handles() {
        let mut table = table_with(2);
        let open = SessionHandle::new(0, "ses-0");
        let closed = SessionHandle::new(1, "ses-1");
        closed.mark_closed();
        table.get_mut(0).unwrap().session = Some(open);
        table.get_mut(1).unwrap().session = Some(closed);

        assert_eq!(table.clear_closed_handles(), vec![1]);
        assert!(table.get(0).unwrap().session.is_some());
        assert!(table.get(1).unwrap().session.is_none());
    }
}
