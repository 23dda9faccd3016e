//! Admission control against the two capacity ceilings.
//!
//! Open pages are reserved the instant a task is promoted to Initializing,
//! before its session exists, so two promotions can never both pass the
//! check ahead of either opening a handle. Active mining is re-derived from
//! live probes rather than cached statuses, since detection lag can let the
//! cached view fall behind the driver.

use std::cmp::Reverse;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::domain::{TaskId, TaskStatus, TaskTable};
use crate::driver::{DetectedStatus, DriverError, SessionHandle, TaskDriver};
use crate::scheduler::core::{InitFinished, SchedulerCore};
use crate::scheduler::events::SchedulerEvent;

/// Open pages, clearing handle references the driver has already closed.
pub fn open_page_count(tasks: &mut TaskTable) -> usize {
    let cleared = tasks.clear_closed_handles();
    if !cleared.is_empty() {
        tracing::debug!(?cleared, "Cleared closed session handles");
    }
    count_open_pages(tasks)
}

/// Open pages without touching the table
pub fn count_open_pages(tasks: &TaskTable) -> usize {
    tasks.iter().filter(|t| t.counts_as_open_page()).count()
}

pub fn active_mining_count(tasks: &TaskTable) -> usize {
    tasks.iter().filter(|t| t.is_actively_mining()).count()
}

/// Ready sessions waiting for, or warming up after, a start click
pub fn sessions_ready(tasks: &TaskTable) -> usize {
    tasks.iter().filter(|t| t.is_session_ready()).count()
}

/// Ready sessions that were already clicked and are expected to start mining
fn armed_count(tasks: &TaskTable) -> usize {
    tasks
        .iter()
        .filter(|t| t.is_session_ready() && t.start_click_count > 0)
        .count()
}

pub struct AdmissionController {
    max_active_mining: usize,
    max_open_pages: usize,
    page_open_concurrency: usize,
    promote_lock: Mutex<()>,
}

impl AdmissionController {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_active_mining: config.max_active_mining,
            max_open_pages: config.max_open_pages,
            page_open_concurrency: config.page_open_concurrency,
            promote_lock: Mutex::new(()),
        }
    }

    /// Pending tasks that may be promoted right now
    pub fn slots(&self, tasks: &mut TaskTable) -> usize {
        let initializing = tasks.count_status(TaskStatus::Initializing);
        let open = open_page_count(tasks);
        let pending = tasks.count_status(TaskStatus::Pending);
        self.page_open_concurrency
            .saturating_sub(initializing)
            .min(self.max_open_pages.saturating_sub(open))
            .min(pending)
    }

    fn within_ceilings(&self, tasks: &mut TaskTable) -> bool {
        open_page_count(tasks) <= self.max_open_pages
            && tasks.count_status(TaskStatus::Initializing) <= self.page_open_concurrency
    }

    /// New start clicks allowed before the mining ceiling would be exceeded
    pub fn click_budget(&self, tasks: &TaskTable) -> usize {
        self.max_active_mining
            .saturating_sub(active_mining_count(tasks) + armed_count(tasks))
    }

    /// Whether one more task may enter Mining
    pub fn may_start_mining(&self, tasks: &TaskTable) -> bool {
        active_mining_count(tasks) < self.max_active_mining
    }

    /// Promote pending tasks into free capacity and start their sessions.
    ///
    /// Single-flight: a call that finds another promotion in progress
    /// returns 0 immediately. Returns the number of tasks promoted.
    pub async fn try_admit_pending<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> usize {
        let Ok(_promoting) = self.promote_lock.try_lock() else {
            tracing::debug!("Admission already in progress");
            return 0;
        };

        if let Some(remaining) = core.breaker.lock().await.remaining_pause() {
            tracing::debug!(remaining_ms = remaining.as_millis() as u64, "Admission paused");
            return 0;
        }

        let mut promoted = Vec::new();
        {
            let mut tasks = core.tasks.lock().await;
            let slots = self.slots(&mut tasks);
            if slots == 0 {
                return 0;
            }

            for id in tasks.ids_with_status(TaskStatus::Pending).into_iter().take(slots) {
                let Some(task) = tasks.get_mut(id) else {
                    continue;
                };
                if let Err(e) = task.promote() {
                    tracing::warn!(task_id = id, error = %e, "Promotion rejected");
                    continue;
                }
                let admitted = (id, task.generation, task.address.clone());

                if !self.within_ceilings(&mut tasks) {
                    if let Some(task) = tasks.get_mut(id) {
                        task.requeue(None);
                    }
                    tracing::warn!(task_id = id, "Ceiling exceeded during promotion, reverted");
                    break;
                }
                promoted.push(admitted);
            }
        }

        for (task_id, generation, address) in &promoted {
            tracing::info!(task_id, generation, "Admitted task");
            self.spawn_init(core, *task_id, *generation, address.clone()).await;
        }
        promoted.len()
    }

    async fn spawn_init<D: TaskDriver + 'static>(
        &self,
        core: &SchedulerCore<D>,
        task_id: TaskId,
        generation: u64,
        address: String,
    ) {
        let driver = core.driver.clone();
        let init_tx = core.init_tx.clone();
        core.inits.lock().await.spawn(async move {
            let started = Instant::now();
            let result = driver.initialize_session(task_id, &address).await;
            let done = InitFinished {
                task_id,
                generation,
                result,
                elapsed: started.elapsed(),
            };
            if let Err(unsent) = init_tx.send(done) {
                // Nobody left to take ownership of the session
                if let Ok(handle) = unsent.0.result {
                    driver.dispose(&handle).await;
                }
            }
        });
    }

    /// Apply the result of an asynchronous session open.
    pub async fn finish_init<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>, done: InitFinished) {
        let InitFinished {
            task_id,
            generation,
            result,
            elapsed,
        } = done;

        let mut tasks = core.tasks.lock().await;
        let current = tasks
            .get_mut(task_id)
            .filter(|t| t.generation == generation && t.status == TaskStatus::Initializing);

        let Some(task) = current else {
            drop(tasks);
            tracing::debug!(task_id, generation, "Discarding stale session open");
            if let Ok(handle) = result {
                core.driver.dispose(&handle).await;
            }
            return;
        };

        match result {
            Ok(handle) => {
                tracing::info!(
                    task_id,
                    session = handle.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Session ready"
                );
                task.session = Some(handle);
                drop(tasks);
                core.stats.lock().await.record_login_latency(elapsed);
                core.breaker.lock().await.record_success();
                core.events.trigger(SchedulerEvent::TaskInitialized);
            }
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Session open failed, returning to pending");
                let partial = task.requeue(Some(e.to_string()));
                drop(tasks);
                if let Some(handle) = partial {
                    core.driver.dispose(&handle).await;
                }
                core.stats.lock().await.record_failure();
                if e.is_throttled() {
                    core.breaker.lock().await.record_throttled();
                }
                core.events.trigger(SchedulerEvent::PageClosed);
            }
        }
    }

    /// Stop the newest excess miners until the probed mining count is within
    /// the ceiling. Returns the number of tasks stopped or closed.
    pub async fn enforce_active_mining_ceiling<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> usize {
        let candidates: Vec<(TaskId, u64, SessionHandle, Option<DateTime<Utc>>)> = {
            let tasks = core.tasks.lock().await;
            tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Initializing | TaskStatus::Mining))
                .filter_map(|t| {
                    let handle = t.session.clone().filter(|h| !h.is_closed())?;
                    Some((t.id, t.generation, handle, t.mining_cycle_started_at))
                })
                .collect()
        };

        let probes = join_all(candidates.into_iter().map(|(id, generation, handle, started)| async move {
            let status = core.driver.detect_status(&handle).await;
            (id, generation, handle, started, status)
        }))
        .await;

        let mut mining: Vec<_> = probes
            .into_iter()
            .filter(|(.., status)| *status == DetectedStatus::Mining)
            .map(|(id, generation, handle, started, _)| (id, generation, handle, started))
            .collect();

        if mining.len() <= self.max_active_mining {
            return 0;
        }

        // Oldest first; runs that never recorded a start count as newest
        mining.sort_by_key(|(id, _, _, started)| (started.is_none(), *started, *id));
        let excess = mining.split_off(self.max_active_mining);
        tracing::warn!(
            probed = mining.len() + excess.len(),
            max = self.max_active_mining,
            "Active mining ceiling exceeded"
        );

        let mut enforced = 0;
        let mut closed_any = false;
        for (id, generation, handle, _) in excess {
            let stopped = core.driver.click_stop(&handle).await;
            if self.settle_stop(core, id, generation, &handle, stopped).await {
                closed_any = true;
            }
            enforced += 1;
        }
        if closed_any {
            core.events.trigger(SchedulerEvent::PageClosed);
        }
        enforced
    }

    /// Returns true if the task's session had to be force-closed
    async fn settle_stop<D: TaskDriver + 'static>(
        &self,
        core: &SchedulerCore<D>,
        id: TaskId,
        generation: u64,
        handle: &SessionHandle,
        stopped: Result<(), DriverError>,
    ) -> bool {
        let mut tasks = core.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|t| t.generation == generation) else {
            return false;
        };

        match stopped {
            Ok(()) => {
                if task.status == TaskStatus::Mining
                    && let Err(e) = task.transition(TaskStatus::Initializing)
                {
                    tracing::warn!(task_id = id, error = %e, "Rejected transition");
                }
                task.start_click_count = 0;
                task.last_start_click_at = None;
                tracing::info!(task_id = id, "Stopped excess miner");
                false
            }
            Err(e) => {
                tracing::warn!(task_id = id, error = %e, "Stop failed, force-closing session");
                let released = match task.status {
                    TaskStatus::Mining => {
                        let released = task.take_session();
                        if let Err(e) = task.transition(TaskStatus::Closed) {
                            tracing::warn!(task_id = id, error = %e, "Rejected transition");
                        }
                        task.last_error = Some(e.to_string());
                        released
                    }
                    _ => task.requeue(Some(e.to_string())),
                };
                drop(tasks);
                core.driver.dispose(released.as_ref().unwrap_or(handle)).await;
                true
            }
        }
    }

    /// Force-close the lowest-priority tasks while open pages exceed the
    /// ceiling: Initializing first, then newest-created.
    pub async fn enforce_open_page_ceiling<D: TaskDriver + 'static>(&self, core: &SchedulerCore<D>) -> usize {
        let (closed, released) = {
            let mut tasks = core.tasks.lock().await;
            let open = open_page_count(&mut tasks);
            if open <= self.max_open_pages {
                return 0;
            }

            let mut victims: Vec<_> = tasks
                .iter()
                .filter(|t| t.counts_as_open_page())
                .map(|t| (t.status != TaskStatus::Initializing, Reverse(t.created_at), Reverse(t.id)))
                .collect();
            victims.sort();
            victims.truncate(open - self.max_open_pages);
            tracing::warn!(open, max = self.max_open_pages, "Open page ceiling exceeded");

            let mut released = Vec::new();
            for (_, _, Reverse(id)) in &victims {
                let Some(task) = tasks.get_mut(*id) else {
                    continue;
                };
                tracing::warn!(task_id = id, status = %task.status, "Force-closing excess page");
                released.extend(task.requeue(Some("open page ceiling exceeded".to_string())));
            }
            (victims.len(), released)
        };

        join_all(released.iter().map(|h| core.driver.dispose(h))).await;
        core.events.trigger(SchedulerEvent::PageClosed);
        closed
    }
}
