//! Session health and bounded recovery.
//!
//! Three mechanisms live here:
//! - the periodic health sweep: one reload attempt per unhealthy session,
//!   adopting whatever recognizable state the reload lands in
//! - crash refresh, applied by the tick when a probe reports a crash:
//!   spaced reloads up to a limit, then the task is quarantined in Error
//! - the stuck-initialization heuristic and the Error sweep back to Pending

use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::HealthConfig;
use crate::domain::{TaskId, TaskStatus};
use crate::driver::{DetectedStatus, SessionHandle, TaskDriver};
use crate::scheduler::core::{SchedulerCore, complete_run};
use crate::scheduler::events::SchedulerEvent;

/// What a health sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub unhealthy: usize,
    pub recovered: usize,
    pub requeued: usize,
}

/// Outcome of one crash-refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashAction {
    /// Reloaded; attempt number attached
    Refreshed(u32),
    /// Too soon after the previous refresh
    Spaced,
    /// Refresh budget exhausted; task moved to Error
    Quarantined,
    /// Task changed underneath the probe
    Stale,
}

pub struct HealthMonitor {
    config: HealthConfig,
    last_run: Mutex<Option<Instant>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            config: config.clone(),
            last_run: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn claim_run(&self) -> bool {
        let mut last_run = self.last_run.lock().await;
        if last_run.is_some_and(|t| t.elapsed() < self.config.interval()) {
            return false;
        }
        *last_run = Some(Instant::now());
        true
    }

    /// Check every open Initializing/Mining session, at most once per interval.
    pub async fn run<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> Option<HealthReport> {
        if !self.claim_run().await {
            return None;
        }

        let targets: Vec<(TaskId, u64, SessionHandle)> = {
            let tasks = core.tasks.lock().await;
            tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Initializing | TaskStatus::Mining))
                .filter_map(|t| {
                    let handle = t.session.clone().filter(|h| !h.is_closed())?;
                    Some((t.id, t.generation, handle))
                })
                .collect()
        };

        let mut report = HealthReport {
            checked: targets.len(),
            ..Default::default()
        };
        let checks = join_all(targets.into_iter().map(|(id, generation, handle)| async move {
            let health = core.driver.check_health(&handle).await;
            (id, generation, handle, health)
        }))
        .await;

        for (id, generation, handle, health) in checks {
            if health.is_healthy() {
                continue;
            }
            report.unhealthy += 1;
            tracing::warn!(task_id = id, ?health, "Unhealthy session, reloading");
            if self.recover(core, id, generation, handle).await {
                report.recovered += 1;
            } else {
                report.requeued += 1;
            }
        }

        if report.unhealthy > 0 {
            tracing::info!(
                checked = report.checked,
                unhealthy = report.unhealthy,
                recovered = report.recovered,
                requeued = report.requeued,
                "Health sweep finished"
            );
        }
        Some(report)
    }

    /// Reload once and adopt the resulting state. Returns false if the
    /// session had to be dropped.
    async fn recover<D: TaskDriver + 'static>(
        &self,
        core: &SchedulerCore<D>,
        id: TaskId,
        generation: u64,
        handle: SessionHandle,
    ) -> bool {
        let status = match core.driver.reload(&handle).await {
            Ok(()) => core.driver.detect_status(&handle).await,
            Err(e) => DetectedStatus::Error(e.to_string()),
        };
        let cycle = core.cycle.current();

        let mut tasks = core.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|t| t.generation == generation) else {
            return true;
        };

        let adopted = status.is_recognized()
            && match (&status, task.status) {
                (DetectedStatus::Mining, TaskStatus::Mining) => true,
                (DetectedStatus::Mining, TaskStatus::Initializing) => {
                    let started = task.begin_mining(cycle).is_ok();
                    if started {
                        core.events.trigger(SchedulerEvent::TaskMiningStarted);
                    }
                    started
                }
                (DetectedStatus::StartReady, TaskStatus::Mining) => {
                    let stopped = task.transition(TaskStatus::Initializing).is_ok();
                    task.start_click_count = 0;
                    task.last_start_click_at = None;
                    core.events.trigger(SchedulerEvent::TaskStatusChanged);
                    stopped
                }
                (DetectedStatus::StartReady, TaskStatus::Initializing) => true,
                (DetectedStatus::Completed, TaskStatus::Initializing | TaskStatus::Mining) => {
                    let mut stats = core.stats.lock().await;
                    let completed = complete_run(task, &mut stats, cycle).is_ok();
                    if completed {
                        core.events.trigger(SchedulerEvent::TaskCompleted);
                    }
                    completed
                }
                _ => false,
            };

        if adopted {
            tracing::info!(task_id = id, ?status, "Session recovered after reload");
            return true;
        }

        tracing::warn!(task_id = id, ?status, "Reload did not recover session, returning to pending");
        let released = task.requeue(Some(format!("unrecovered after reload: {:?}", status)));
        core.stats.lock().await.record_failure();
        drop(tasks);
        if let Some(handle) = released {
            core.driver.dispose(&handle).await;
        }
        core.events.trigger(SchedulerEvent::PageClosed);
        false
    }

    /// Apply one step of crash-refresh recovery to a task whose probe
    /// reported a crash.
    pub async fn crash_refresh<D: TaskDriver + 'static>(
        &self,
        core: &SchedulerCore<D>,
        id: TaskId,
        generation: u64,
        handle: &SessionHandle,
    ) -> CrashAction {
        let attempt = {
            let mut tasks = core.tasks.lock().await;
            let Some(task) = tasks.get_mut(id).filter(|t| t.generation == generation) else {
                return CrashAction::Stale;
            };

            if task
                .last_crash_refresh_at
                .is_some_and(|t| t.elapsed() >= self.config.crash_refresh_window())
            {
                task.crash_refresh_count = 0;
            }
            if task
                .last_crash_refresh_at
                .is_some_and(|t| t.elapsed() < self.config.crash_refresh_spacing())
            {
                return CrashAction::Spaced;
            }

            if task.crash_refresh_count >= self.config.max_crash_refreshes {
                let reason = format!("crashed after {} refresh attempts", task.crash_refresh_count);
                if let Err(e) = task.fail(reason) {
                    tracing::warn!(task_id = id, error = %e, "Rejected transition");
                    return CrashAction::Stale;
                }
                tracing::error!(task_id = id, refreshes = task.crash_refresh_count, "Crash refresh budget exhausted");
                let released = task.take_session();
                drop(tasks);
                if let Some(handle) = released {
                    core.driver.dispose(&handle).await;
                }
                core.stats.lock().await.record_failure();
                core.events.trigger(SchedulerEvent::TaskError);
                return CrashAction::Quarantined;
            }

            task.crash_refresh_count += 1;
            task.last_crash_refresh_at = Some(Instant::now());
            task.crash_refresh_count
        };

        tracing::warn!(task_id = id, attempt, "Session crashed, refreshing");
        if let Err(e) = core.driver.reload(handle).await {
            tracing::warn!(task_id = id, error = %e, "Crash refresh failed");
        }
        CrashAction::Refreshed(attempt)
    }

    /// Quarantine Initializing tasks that keep clicking start without their
    /// status changing for `stuck-after-ms`. Re-clicks do not restart the
    /// clock. Returns the number of tasks failed.
    pub async fn fail_stuck<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> usize {
        let mut stuck = 0;
        let mut released = Vec::new();
        {
            let mut tasks = core.tasks.lock().await;
            for task in tasks.iter_mut() {
                let is_stuck = task.status == TaskStatus::Initializing
                    && task.start_click_count > self.config.stuck_click_threshold
                    && task.status_changed_at.elapsed() >= self.config.stuck_after();
                if !is_stuck {
                    continue;
                }
                let reason = format!("stuck initializing after {} start clicks", task.start_click_count);
                if task.fail(reason).is_ok() {
                    tracing::warn!(task_id = task.id, clicks = task.start_click_count, "Task stuck initializing");
                    released.extend(task.take_session());
                    stuck += 1;
                }
            }
        }
        join_all(released.iter().map(|h| core.driver.dispose(h))).await;

        if stuck > 0 {
            let mut stats = core.stats.lock().await;
            for _ in 0..stuck {
                stats.record_failure();
            }
            drop(stats);
            core.events.trigger(SchedulerEvent::TaskError);
        }
        stuck
    }

    /// Dispose Error tasks' sessions and return them to Pending. Failures
    /// were counted when the task entered Error.
    pub async fn recover_errored<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> usize {
        let (swept, released) = {
            let mut tasks = core.tasks.lock().await;
            let mut swept = 0;
            let mut released = Vec::new();
            for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Error) {
                let reason = task.last_error.take();
                released.extend(task.requeue(reason));
                swept += 1;
                tracing::info!(task_id = task.id, "Returned errored task to pending");
            }
            (swept, released)
        };

        join_all(released.iter().map(|h| core.driver.dispose(h))).await;
        if swept > 0 {
            core.events.trigger(SchedulerEvent::PageClosed);
        }
        swept
    }
}
