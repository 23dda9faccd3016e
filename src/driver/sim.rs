//! Clock-driven driver used by `minerd run`.
//!
//! Sessions walk through fixed phases timed by [`SimulationConfig`]:
//! open (`init-ms`), start-ready until clicked, a `start-delay-ms` warmup,
//! `mining-ms` of mining, then completed. With `crash-every: N`, every Nth
//! session crashes once partway through mining and recovers on reload.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{DetectedStatus, DriverError, DriverNotifier, SessionHandle, SessionHealth, TaskDriver};
use crate::config::SimulationConfig;
use crate::domain::TaskId;
use crate::id::generate_session_id;

#[derive(Debug)]
struct SimSession {
    clicked_at: Option<Instant>,
    crash_pending: bool,
    crashed: bool,
    submitted: bool,
}

#[derive(Default)]
struct SimState {
    sessions: HashMap<String, SimSession>,
    opened: u64,
    notifier: Option<DriverNotifier>,
}

pub struct SimulatedDriver {
    init: Duration,
    start_delay: Duration,
    mining: Duration,
    crash_every: u64,
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            init: Duration::from_millis(config.init_ms),
            start_delay: Duration::from_millis(config.start_delay_ms),
            mining: Duration::from_millis(config.mining_ms),
            crash_every: config.crash_every,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self, session: &SimSession) -> DetectedStatus {
        let Some(clicked_at) = session.clicked_at else {
            return DetectedStatus::StartReady;
        };
        let elapsed = clicked_at.elapsed();
        if elapsed < self.start_delay {
            DetectedStatus::Initializing
        } else if elapsed < self.start_delay + self.mining {
            DetectedStatus::Mining
        } else {
            DetectedStatus::Completed
        }
    }

    fn crash_due(&self, session: &SimSession) -> bool {
        session.crash_pending
            && session
                .clicked_at
                .is_some_and(|t| t.elapsed() >= self.start_delay + self.mining / 2)
    }
}

#[async_trait]
impl TaskDriver for SimulatedDriver {
    async fn launch(&self, notifier: DriverNotifier) -> Result<(), DriverError> {
        self.state().notifier = Some(notifier);
        log::info!("Simulated driver launched");
        Ok(())
    }

    async fn initialize_session(&self, task_id: TaskId, address: &str) -> Result<SessionHandle, DriverError> {
        tokio::time::sleep(self.init).await;

        let handle = SessionHandle::new(task_id, generate_session_id(task_id));
        let mut state = self.state();
        state.opened += 1;
        let crash_pending = self.crash_every > 0 && state.opened % self.crash_every == 0;
        state.sessions.insert(
            handle.id().to_string(),
            SimSession {
                clicked_at: None,
                crash_pending,
                crashed: false,
                submitted: false,
            },
        );
        log::debug!("Opened simulated session {} for {}", handle.id(), address);
        Ok(handle)
    }

    async fn detect_status(&self, handle: &SessionHandle) -> DetectedStatus {
        if handle.is_closed() {
            return DetectedStatus::Error("session closed".to_string());
        }

        let (status, notifier) = {
            let mut state = self.state();
            let notifier = state.notifier.clone();
            let Some(session) = state.sessions.get(handle.id()) else {
                return DetectedStatus::Error("unknown session".to_string());
            };
            if session.crashed || self.crash_due(session) {
                if let Some(session) = state.sessions.get_mut(handle.id()) {
                    session.crashed = true;
                    session.crash_pending = false;
                }
                return DetectedStatus::Crashed;
            }
            let status = self.phase(session);
            let first_completion = status == DetectedStatus::Completed && !session.submitted;
            if first_completion && let Some(session) = state.sessions.get_mut(handle.id()) {
                session.submitted = true;
            }
            (status, notifier.filter(|_| first_completion))
        };

        if let Some(notifier) = notifier {
            let _guard = notifier.begin_submission(handle.task_id());
            notifier.solution_submitted(handle.task_id());
        }
        status
    }

    async fn click_start(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let session = state.sessions.get_mut(handle.id()).ok_or(DriverError::SessionClosed)?;
        if session.clicked_at.is_none() {
            session.clicked_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn click_stop(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let session = state.sessions.get_mut(handle.id()).ok_or(DriverError::SessionClosed)?;
        session.clicked_at = None;
        Ok(())
    }

    async fn check_health(&self, handle: &SessionHandle) -> SessionHealth {
        let state = self.state();
        match state.sessions.get(handle.id()) {
            None => SessionHealth::Unresponsive,
            Some(session) if session.crashed || self.crash_due(session) => SessionHealth::Crashed,
            Some(_) => SessionHealth::Healthy,
        }
    }

    async fn reload(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let session = state.sessions.get_mut(handle.id()).ok_or(DriverError::SessionClosed)?;
        session.crashed = false;
        session.crash_pending = false;
        Ok(())
    }

    async fn dispose(&self, handle: &SessionHandle) {
        handle.mark_closed();
        self.state().sessions.remove(handle.id());
    }

    async fn shutdown(&self) {
        let mut state = self.state();
        state.sessions.clear();
        state.notifier = None;
        log::info!("Simulated driver shut down");
    }
}
