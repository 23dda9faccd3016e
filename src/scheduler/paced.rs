//! The only path from the scheduler to a [`TaskDriver`].
//!
//! Navigation-class calls (session open, clicks, reload) queue on the
//! [`RateLimiter`]; polling-class calls (status probe, health check) wait on
//! the [`SubmissionGate`]. Every call carries a bounded timeout except
//! dispose, and throttling feedback is recorded on the way back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PacingConfig, TimeoutConfig};
use crate::domain::TaskId;
use crate::driver::{DetectedStatus, DriverError, DriverNotifier, SessionHandle, SessionHealth, TaskDriver};
use crate::scheduler::gate::SubmissionGate;
use crate::scheduler::limiter::RateLimiter;

pub struct PacedDriver<D: TaskDriver> {
    inner: Arc<D>,
    limiter: Arc<RateLimiter>,
    gate: Arc<SubmissionGate>,
    timeouts: TimeoutConfig,
}

impl<D: TaskDriver> PacedDriver<D> {
    pub fn new(inner: Arc<D>, pacing: &PacingConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            inner,
            limiter: Arc::new(RateLimiter::new(&pacing.navigation)),
            gate: Arc::new(SubmissionGate::new(pacing)),
            timeouts,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn gate(&self) -> &Arc<SubmissionGate> {
        &self.gate
    }

    async fn navigate<T, F>(&self, op: &'static str, limit: Duration, call: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        self.limiter.acquire().await;
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => {
                self.limiter.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_throttled() {
                    self.limiter.record_throttled().await;
                }
                Err(e)
            }
            Err(_) => {
                tracing::warn!(op, timeout_ms = limit.as_millis() as u64, "Driver call timed out");
                Err(DriverError::Timeout(op))
            }
        }
    }

    pub async fn launch(&self, notifier: DriverNotifier) -> Result<(), DriverError> {
        self.inner.launch(notifier).await
    }

    pub async fn initialize_session(&self, task_id: TaskId, address: &str) -> Result<SessionHandle, DriverError> {
        self.navigate(
            "initialize_session",
            self.timeouts.init(),
            self.inner.initialize_session(task_id, address),
        )
        .await
    }

    pub async fn click_start(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        self.navigate("click_start", self.timeouts.click(), self.inner.click_start(handle))
            .await
    }

    pub async fn click_stop(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        self.navigate("click_stop", self.timeouts.click(), self.inner.click_stop(handle))
            .await
    }

    pub async fn reload(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        self.navigate("reload", self.timeouts.reload(), self.inner.reload(handle))
            .await
    }

    /// Probe a session's status. A probe that does not answer in time is
    /// reported as a driver error, which leaves the task's state untouched.
    pub async fn detect_status(&self, handle: &SessionHandle) -> DetectedStatus {
        self.gate.wait_for_poll_slot().await;
        let status = match tokio::time::timeout(self.timeouts.health(), self.inner.detect_status(handle)).await {
            Ok(status) => status,
            Err(_) => DetectedStatus::Error("status probe timed out".to_string()),
        };
        if status == DetectedStatus::Throttled {
            self.gate.record_throttled().await;
        } else {
            self.gate.record_success().await;
        }
        status
    }

    pub async fn check_health(&self, handle: &SessionHandle) -> SessionHealth {
        self.gate.wait_for_poll_slot().await;
        match tokio::time::timeout(self.timeouts.health(), self.inner.check_health(handle)).await {
            Ok(health) => health,
            Err(_) => {
                tracing::warn!(task_id = handle.task_id(), "Health check timed out");
                SessionHealth::Unresponsive
            }
        }
    }

    /// Release a session. Safe to call on an already-closed handle.
    pub async fn dispose(&self, handle: &SessionHandle) {
        self.inner.dispose(handle).await;
        handle.mark_closed();
        // A fresh session for this task is due immediately
        self.gate.forget(handle.task_id()).await;
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntervalConfig;
    use crate::driver::MockDriver;

    fn paced(mock: Arc<MockDriver>) -> PacedDriver<MockDriver> {
        let pacing = PacingConfig {
            navigation: IntervalConfig {
                base_ms: 1,
                max_ms: 100,
                multiplier: 2.0,
                recovery_ms: 60_000,
            },
            ..Default::default()
        };
        PacedDriver::new(mock, &pacing, TimeoutConfig::default())
    }

    #[tokio::test]
    async fn test_throttled_init_widens_navigation_interval() {
        let mock = Arc::new(MockDriver::new());
        mock.fail_next_init(1, DriverError::Throttled { retry_after: None });
        let driver = paced(mock);

        let err = driver.initialize_session(1, "addr").await.unwrap_err();
        assert!(err.is_throttled());
        assert_eq!(driver.limiter().current_interval().await, Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_throttled_probe_widens_poll_interval() {
        let mock = Arc::new(MockDriver::new());
        let driver = paced(mock.clone());
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        let before = driver.gate().poll_interval().await;

        mock.set_status(1, DetectedStatus::Throttled);
        assert_eq!(driver.detect_status(&handle).await, DetectedStatus::Throttled);
        assert!(driver.gate().poll_interval().await > before);
    }

    #[tokio::test]
    async fn test_dispose_marks_handle_closed() {
        let mock = Arc::new(MockDriver::new());
        let driver = paced(mock.clone());
        let handle = driver.initialize_session(1, "addr").await.unwrap();
        driver.dispose(&handle).await;
        driver.dispose(&handle).await;
        assert!(handle.is_closed());
        assert_eq!(mock.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_slow_init_times_out() {
        let mock = Arc::new(MockDriver::new().with_init_delay(Duration::from_millis(200)));
        let pacing = PacingConfig::default();
        let timeouts = TimeoutConfig {
            init_ms: 20,
            ..Default::default()
        };
        let driver = PacedDriver::new(mock, &pacing, timeouts);
        let err = driver.initialize_session(1, "addr").await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout("initialize_session")));
    }
}
