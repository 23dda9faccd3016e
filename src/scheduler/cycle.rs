//! Hourly cycle rollover.
//!
//! A cycle is one wall-clock hour (UTC). When the hour changes the manager
//! bumps the cycle number and resets tasks in one of two modes:
//!
//! - **Hard**: every session is disposed and every task returns to Pending
//!   with its per-cycle fields cleared. Events are suppressed during the
//!   sweep and a single `PageClosed` restarts admission afterwards.
//! - **Soft**: miners that started in the outgoing cycle keep running into
//!   the new one. Miners from an earlier cycle, and every other task holding
//!   a session, are closed and reset.
//!
//! Both modes clear the admission breaker and per-cycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::domain::TaskStatus;
use crate::driver::{SessionHandle, TaskDriver};
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::events::SchedulerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    Hard,
    Soft,
}

impl ResetMode {
    pub fn from_reset_at_hour(reset_at_hour: bool) -> Self {
        if reset_at_hour { ResetMode::Hard } else { ResetMode::Soft }
    }
}

/// Hours since the epoch
pub fn hour_index(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

#[derive(Debug)]
struct CycleState {
    hour_index: i64,
    started_at: DateTime<Utc>,
}

/// What a rollover did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub outgoing: u64,
    pub incoming: u64,
    /// Miners carried into the new cycle
    pub preserved: usize,
    /// Tasks returned to Pending
    pub reset: usize,
    /// Sessions disposed
    pub disposed: usize,
}

pub struct CycleManager {
    mode: ResetMode,
    number: AtomicU64,
    state: Mutex<CycleState>,
}

impl CycleManager {
    pub fn new(mode: ResetMode) -> Self {
        Self::starting_at(mode, Utc::now())
    }

    pub fn starting_at(mode: ResetMode, now: DateTime<Utc>) -> Self {
        Self {
            mode,
            number: AtomicU64::new(0),
            state: Mutex::new(CycleState {
                hour_index: hour_index(now),
                started_at: now,
            }),
        }
    }

    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    /// Current cycle number
    pub fn current(&self) -> u64 {
        self.number.load(Ordering::Acquire)
    }

    pub async fn started_at(&self) -> DateTime<Utc> {
        self.state.lock().await.started_at
    }

    /// Roll over if the wall-clock hour changed
    pub async fn check<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> Option<ResetReport> {
        self.rollover_at(core, Utc::now()).await
    }

    /// Roll over if `now` falls in a different hour than the current cycle
    pub async fn rollover_at<D: TaskDriver + 'static>(
        &self,
        core: &SchedulerCore<D>,
        now: DateTime<Utc>,
    ) -> Option<ResetReport> {
        let outgoing = {
            let mut state = self.state.lock().await;
            let hour = hour_index(now);
            if hour == state.hour_index {
                return None;
            }
            state.hour_index = hour;
            state.started_at = now;
            self.number.fetch_add(1, Ordering::AcqRel)
        };
        let incoming = outgoing + 1;
        tracing::info!(outgoing, incoming, mode = ?self.mode, "Cycle rollover");

        let mut report = match self.mode {
            ResetMode::Hard => self.hard_reset(core).await,
            ResetMode::Soft => self.soft_reset(core, outgoing).await,
        };
        report.outgoing = outgoing;
        report.incoming = incoming;

        core.breaker.lock().await.reset();
        core.stats.lock().await.reset_cycle();
        tracing::info!(
            cycle = incoming,
            preserved = report.preserved,
            reset = report.reset,
            disposed = report.disposed,
            "Cycle reset finished"
        );
        core.events.trigger(SchedulerEvent::PageClosed);
        Some(report)
    }

    async fn hard_reset<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> ResetReport {
        core.events.suppress();
        let (reset, released): (usize, Vec<SessionHandle>) = {
            let mut tasks = core.tasks.lock().await;
            let mut released = Vec::new();
            for task in tasks.iter_mut() {
                released.extend(task.reset_for_cycle());
            }
            (tasks.len(), released)
        };
        let disposed = dispose_all(core, &released).await;
        core.events.resume();

        ResetReport {
            reset,
            disposed,
            ..Default::default()
        }
    }

    async fn soft_reset<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>, outgoing: u64) -> ResetReport {
        let mut report = ResetReport::default();
        let released: Vec<SessionHandle> = {
            let mut tasks = core.tasks.lock().await;
            let mut released = Vec::new();
            for task in tasks.iter_mut() {
                if task.status == TaskStatus::Mining && task.has_open_session() {
                    match task.mining_cycle {
                        None => {
                            task.mining_cycle = Some(outgoing);
                            report.preserved += 1;
                            continue;
                        }
                        Some(cycle) if cycle >= outgoing => {
                            report.preserved += 1;
                            continue;
                        }
                        Some(cycle) => {
                            tracing::warn!(task_id = task.id, started_in = cycle, "Miner spanned a full cycle, closing");
                        }
                    }
                } else if task.status == TaskStatus::Pending && task.session.is_none() {
                    // Nothing to close; only the per-cycle fields go
                    task.completed_in_cycle = None;
                    task.submitted_solution = false;
                    continue;
                }
                released.extend(task.reset_for_cycle());
                report.reset += 1;
            }
            released
        };
        report.disposed = dispose_all(core, &released).await;
        report
    }
}

async fn dispose_all<D: TaskDriver + 'static>(core: &SchedulerCore<D>, handles: &[SessionHandle]) -> usize {
    join_all(handles.iter().map(|h| core.driver.dispose(h))).await;
    handles.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_index() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 1, 10, 59, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap();
        assert_eq!(hour_index(a), hour_index(b));
        assert_eq!(hour_index(a) + 1, hour_index(c));
    }

    #[test]
    fn test_reset_mode_from_flag() {
        assert_eq!(ResetMode::from_reset_at_hour(true), ResetMode::Hard);
        assert_eq!(ResetMode::from_reset_at_hour(false), ResetMode::Soft);
    }

    #[test]
    fn test_new_manager_starts_at_cycle_zero() {
        let cycle = CycleManager::new(ResetMode::Soft);
        assert_eq!(cycle.current(), 0);
        assert_eq!(cycle.mode(), ResetMode::Soft);
    }

    mod rollover {
        use chrono::Duration;

        use crate::domain::TaskStatus;
        use crate::scheduler::testing::{core_with, settle, status_of, test_config};

        #[tokio::test]
        async fn test_same_hour_is_not_a_rollover() {
            let (_mock, core, _mailbox) = core_with(test_config(), 1);
            assert!(core.cycle.check(&core).await.is_none());
            assert_eq!(core.cycle.current(), 0);
        }

        #[tokio::test]
        async fn test_hard_reset_returns_everything_to_pending() {
            let (mock, core, mut mailbox) = core_with(test_config(), 3);
            core.try_admit_pending().await;
            settle(&core, &mut mailbox).await;
            assert_eq!(mock.open_sessions(), 3);

            let report = core
                .cycle
                .rollover_at(&core, chrono::Utc::now() + Duration::hours(1))
                .await
                .unwrap();

            assert_eq!((report.outgoing, report.incoming), (0, 1));
            assert_eq!(report.reset, 3);
            assert_eq!(report.disposed, 3);
            assert_eq!(core.cycle.current(), 1);
            assert_eq!(mock.open_sessions(), 0);
            assert_eq!(core.tasks.lock().await.count_status(TaskStatus::Pending), 3);
            // One admission restart for the whole sweep
            assert_eq!(mailbox.events.clear(), 1);
        }

        #[tokio::test]
        async fn test_soft_reset_keeps_current_miners_for_one_cycle() {
            let mut config = test_config();
            config.scheduler.reset_at_hour = false;
            config.scheduler.max_active_mining = 1;
            config.scheduler.max_open_pages = 2;
            let (mock, core, mut mailbox) = core_with(config, 3);
            mock.mine_on_click(true);

            core.try_admit_pending().await;
            settle(&core, &mut mailbox).await;
            core.tick().await;
            settle(&core, &mut mailbox).await;
            assert_eq!(status_of(&core, 0).await, TaskStatus::Mining);
            assert_eq!(status_of(&core, 1).await, TaskStatus::Initializing);
            assert_eq!(status_of(&core, 2).await, TaskStatus::Pending);

            let now = chrono::Utc::now();
            let first = core.cycle.rollover_at(&core, now + Duration::hours(1)).await.unwrap();
            assert_eq!(first.preserved, 1);
            assert_eq!(first.reset, 1);
            assert_eq!(first.disposed, 1);
            assert_eq!(status_of(&core, 0).await, TaskStatus::Mining);
            assert_eq!(status_of(&core, 1).await, TaskStatus::Pending);
            assert!(mock.session(0).is_some());
            assert!(mock.session(1).is_none());

            let second = core.cycle.rollover_at(&core, now + Duration::hours(2)).await.unwrap();
            assert_eq!(second.preserved, 0);
            assert_eq!(second.reset, 1);
            assert_eq!(status_of(&core, 0).await, TaskStatus::Pending);
            assert_eq!(mock.open_sessions(), 0);
        }

        #[tokio::test]
        async fn test_soft_reset_backfills_missing_mining_cycle() {
            let mut config = test_config();
            config.scheduler.reset_at_hour = false;
            let (mock, core, mut mailbox) = core_with(config, 1);
            core.try_admit_pending().await;
            settle(&core, &mut mailbox).await;
            {
                // A miner whose start cycle was never recorded
                let mut tasks = core.tasks.lock().await;
                let task = tasks.get_mut(0).unwrap();
                task.begin_mining(0).unwrap();
                task.mining_cycle = None;
            }

            let now = chrono::Utc::now();
            let first = core.cycle.rollover_at(&core, now + Duration::hours(1)).await.unwrap();
            assert_eq!(first.preserved, 1);
            assert_eq!(first.reset, 0);
            assert_eq!(status_of(&core, 0).await, TaskStatus::Mining);
            assert_eq!(core.tasks.lock().await.get(0).unwrap().mining_cycle, Some(first.outgoing));
            assert!(mock.session(0).is_some());

            let second = core.cycle.rollover_at(&core, now + Duration::hours(2)).await.unwrap();
            assert_eq!(second.preserved, 0);
            assert_eq!(second.reset, 1);
            assert_eq!(status_of(&core, 0).await, TaskStatus::Pending);
            assert_eq!(mock.open_sessions(), 0);
        }
    }
}
