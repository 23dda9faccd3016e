//! Scriptable in-memory driver for tests.
//!
//! Each task has at most one live session, so all scripting is keyed by task
//! id. A fresh session reports `StartReady`; tests move it along with
//! [`MockDriver::set_status`] or let `click_start` flip it to `Mining`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{DetectedStatus, DriverError, DriverNotifier, SessionHandle, SessionHealth, TaskDriver};
use crate::domain::TaskId;
use crate::id::generate_session_id;

/// Call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub launch: usize,
    pub initialize: usize,
    pub detect: usize,
    pub click_start: usize,
    pub click_stop: usize,
    pub health: usize,
    pub reload: usize,
    pub dispose: usize,
    pub shutdown: usize,
}

#[derive(Default)]
struct MockState {
    statuses: HashMap<TaskId, DetectedStatus>,
    reload_statuses: HashMap<TaskId, DetectedStatus>,
    health: HashMap<TaskId, SessionHealth>,
    init_failures: HashMap<TaskId, VecDeque<DriverError>>,
    fail_every_init: Option<DriverError>,
    click_stop_failures: HashSet<TaskId>,
    mine_on_click: bool,
    launch_failure: Option<DriverError>,
    sessions: HashMap<TaskId, SessionHandle>,
    notifier: Option<DriverNotifier>,
    calls: MockCalls,
}

/// Test double for [`TaskDriver`]
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    init_delay: Option<Duration>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every session open by `delay`
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script the status the next probes of `task_id` report
    pub fn set_status(&self, task_id: TaskId, status: DetectedStatus) {
        self.state().statuses.insert(task_id, status);
    }

    /// Script the status a reload of `task_id` recovers to
    pub fn set_reload_status(&self, task_id: TaskId, status: DetectedStatus) {
        self.state().reload_statuses.insert(task_id, status);
    }

    pub fn set_health(&self, task_id: TaskId, health: SessionHealth) {
        self.state().health.insert(task_id, health);
    }

    /// Fail the next session open for `task_id`
    pub fn fail_next_init(&self, task_id: TaskId, error: DriverError) {
        self.state().init_failures.entry(task_id).or_default().push_back(error);
    }

    /// Fail every session open until cleared with `None`
    pub fn fail_every_init(&self, error: Option<DriverError>) {
        self.state().fail_every_init = error;
    }

    pub fn fail_click_stop(&self, task_id: TaskId) {
        self.state().click_stop_failures.insert(task_id);
    }

    /// Make `click_start` move the session straight to Mining
    pub fn mine_on_click(&self, enabled: bool) {
        self.state().mine_on_click = enabled;
    }

    pub fn fail_launch(&self, error: DriverError) {
        self.state().launch_failure = Some(error);
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls.clone()
    }

    /// Handle of the task's current session, if any
    pub fn session(&self, task_id: TaskId) -> Option<SessionHandle> {
        self.state().sessions.get(&task_id).cloned()
    }

    /// Sessions the driver still considers open
    pub fn open_sessions(&self) -> usize {
        self.state().sessions.values().filter(|h| !h.is_closed()).count()
    }

    /// Simulate the page closing underneath the scheduler
    pub fn close_externally(&self, task_id: TaskId) {
        if let Some(handle) = self.state().sessions.remove(&task_id) {
            handle.mark_closed();
        }
    }

    /// Notifier received at launch
    pub fn notifier(&self) -> Option<DriverNotifier> {
        self.state().notifier.clone()
    }
}

#[async_trait]
impl TaskDriver for MockDriver {
    async fn launch(&self, notifier: DriverNotifier) -> Result<(), DriverError> {
        let mut state = self.state();
        state.calls.launch += 1;
        if let Some(error) = state.launch_failure.clone() {
            return Err(error);
        }
        state.notifier = Some(notifier);
        Ok(())
    }

    async fn initialize_session(&self, task_id: TaskId, _address: &str) -> Result<SessionHandle, DriverError> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.calls.initialize += 1;
        if let Some(error) = state.init_failures.get_mut(&task_id).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if let Some(error) = state.fail_every_init.clone() {
            return Err(error);
        }
        let handle = SessionHandle::new(task_id, generate_session_id(task_id));
        state.statuses.insert(task_id, DetectedStatus::StartReady);
        state.health.remove(&task_id);
        state.sessions.insert(task_id, handle.clone());
        Ok(handle)
    }

    async fn detect_status(&self, handle: &SessionHandle) -> DetectedStatus {
        let mut state = self.state();
        state.calls.detect += 1;
        if handle.is_closed() {
            return DetectedStatus::Error("session closed".to_string());
        }
        state
            .statuses
            .get(&handle.task_id())
            .cloned()
            .unwrap_or(DetectedStatus::StartReady)
    }

    async fn click_start(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        state.calls.click_start += 1;
        if handle.is_closed() {
            return Err(DriverError::SessionClosed);
        }
        if state.mine_on_click {
            state.statuses.insert(handle.task_id(), DetectedStatus::Mining);
        }
        Ok(())
    }

    async fn click_stop(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        state.calls.click_stop += 1;
        if state.click_stop_failures.contains(&handle.task_id()) {
            return Err(DriverError::Failed("stop control not found".to_string()));
        }
        state.statuses.insert(handle.task_id(), DetectedStatus::StartReady);
        Ok(())
    }

    async fn check_health(&self, handle: &SessionHandle) -> SessionHealth {
        let mut state = self.state();
        state.calls.health += 1;
        state
            .health
            .get(&handle.task_id())
            .copied()
            .unwrap_or(SessionHealth::Healthy)
    }

    async fn reload(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        state.calls.reload += 1;
        let task_id = handle.task_id();
        if let Some(status) = state.reload_statuses.remove(&task_id) {
            state.statuses.insert(task_id, status);
            state.health.remove(&task_id);
        }
        Ok(())
    }

    async fn dispose(&self, handle: &SessionHandle) {
        let mut state = self.state();
        state.calls.dispose += 1;
        handle.mark_closed();
        if state.sessions.get(&handle.task_id()).is_some_and(|h| h.id() == handle.id()) {
            state.sessions.remove(&handle.task_id());
        }
    }

    async fn shutdown(&self) {
        self.state().calls.shutdown += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_session_is_start_ready() {
        let driver = MockDriver::new();
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        assert_eq!(driver.detect_status(&handle).await, DetectedStatus::StartReady);
        assert_eq!(driver.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_scripted_init_failure_is_consumed() {
        let driver = MockDriver::new();
        driver.fail_next_init(1, DriverError::Throttled { retry_after: None });
        assert!(driver.initialize_session(1, "addr").await.is_err());
        assert!(driver.initialize_session(1, "addr").await.is_ok());
        assert_eq!(driver.calls().initialize, 2);
    }

    #[tokio::test]
    async fn test_mine_on_click() {
        let driver = MockDriver::new();
        driver.mine_on_click(true);
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        driver.click_start(&handle).await.unwrap();
        assert_eq!(driver.detect_status(&handle).await, DetectedStatus::Mining);
        driver.click_stop(&handle).await.unwrap();
        assert_eq!(driver.detect_status(&handle).await, DetectedStatus::StartReady);
    }

    #[tokio::test]
    async fn test_dispose_closes_handle() {
        let driver = MockDriver::new();
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        driver.dispose(&handle).await;
        assert!(handle.is_closed());
        assert_eq!(driver.open_sessions(), 0);
        assert!(matches!(driver.detect_status(&handle).await, DetectedStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_reload_adopts_scripted_status() {
        let driver = MockDriver::new();
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        driver.set_health(1, SessionHealth::Crashed);
        driver.set_reload_status(1, DetectedStatus::Mining);
        driver.reload(&handle).await.unwrap();
        assert_eq!(driver.check_health(&handle).await, SessionHealth::Healthy);
        assert_eq!(driver.detect_status(&handle).await, DetectedStatus::Mining);
    }
}
