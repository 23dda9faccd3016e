//! Scheduler core: the task table and everything that mutates it.
//!
//! All status changes happen on the actor that owns the [`Mailbox`]: event
//! passes, ticks, health sweeps and async init results are processed one at
//! a time. Driver calls are awaited with the table unlocked; results are
//! applied only if the task's generation still matches the one probed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::config::GlobalConfig;
use crate::domain::{Stats, StatusCounts, Task, TaskId, TaskStatus, TaskTable};
use crate::driver::{DetectedStatus, DriverError, DriverNotice, DriverNotifier, SessionHandle, TaskDriver};
use crate::error::Result;
use crate::scheduler::admission::{self, AdmissionController};
use crate::scheduler::cycle::{CycleManager, ResetMode};
use crate::scheduler::events::{EventDispatcher, EventHandler, EventInbox, SchedulerEvent};
use crate::scheduler::health::HealthMonitor;
use crate::scheduler::paced::PacedDriver;
use crate::scheduler::rate_limit::RateLimitState;

/// Result of an asynchronous session open
#[derive(Debug)]
pub struct InitFinished {
    pub task_id: TaskId,
    /// Generation the task had when it was promoted
    pub generation: u64,
    pub result: std::result::Result<SessionHandle, DriverError>,
    pub elapsed: Duration,
}

/// Receivers owned by the actor
#[derive(Debug)]
pub struct Mailbox {
    pub events: EventInbox,
    pub inits: mpsc::UnboundedReceiver<InitFinished>,
    pub notices: mpsc::UnboundedReceiver<DriverNotice>,
}

/// Mark a run complete and credit its solution at most once
pub fn complete_run(task: &mut Task, stats: &mut Stats, cycle: u64) -> Result<()> {
    task.complete(cycle)?;
    if let Some(started) = task.mining_started_at {
        stats.record_mining_latency(started.elapsed());
    }
    credit_solution(task, stats);
    Ok(())
}

/// Returns false if the run was already credited
pub fn credit_solution(task: &mut Task, stats: &mut Stats) -> bool {
    if task.submitted_solution {
        return false;
    }
    task.submitted_solution = true;
    stats.record_solution();
    true
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rolled_over: bool,
    pub lost_sessions: usize,
    pub force_closed: usize,
    pub probed: usize,
    pub clicked: usize,
    pub stuck: usize,
    pub admitted: usize,
}

/// Read-only aggregate for operators
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: bool,
    pub cycle: u64,
    pub cycle_started_at: DateTime<Utc>,
    pub reset_mode: ResetMode,
    pub tasks: StatusCounts,
    pub open_pages: usize,
    pub max_open_pages: usize,
    pub active_mining: usize,
    pub max_active_mining: usize,
    pub initializing: usize,
    pub page_open_concurrency: usize,
    /// Sessions opened and waiting to mine; derived from task state
    pub sessions_ready: usize,
    pub success: u64,
    pub failed: u64,
    pub submitted_solutions: u64,
    pub submitted_in_cycle: u64,
    pub avg_login_latency_ms: Option<u64>,
    pub avg_mining_latency_ms: Option<u64>,
    pub login_samples: usize,
    pub mining_samples: usize,
    pub consecutive_throttled: u32,
    pub admission_paused_ms: Option<u64>,
    pub navigation_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub submissions_in_flight: usize,
    pub inits_in_flight: usize,
}

pub struct SchedulerCore<D: TaskDriver + 'static> {
    pub(crate) config: GlobalConfig,
    pub(crate) tasks: Mutex<TaskTable>,
    pub(crate) stats: Mutex<Stats>,
    pub(crate) breaker: Mutex<RateLimitState>,
    pub(crate) driver: Arc<PacedDriver<D>>,
    pub(crate) events: EventDispatcher,
    pub(crate) admission: AdmissionController,
    pub(crate) cycle: CycleManager,
    pub(crate) health: HealthMonitor,
    pub(crate) init_tx: mpsc::UnboundedSender<InitFinished>,
    pub(crate) notice_tx: mpsc::UnboundedSender<DriverNotice>,
    pub(crate) inits: Mutex<JoinSet<()>>,
}

impl<D: TaskDriver + 'static> SchedulerCore<D> {
    pub fn new(config: GlobalConfig, driver: Arc<D>) -> (Self, Mailbox) {
        let (events, inbox) = EventDispatcher::new();
        let (init_tx, inits) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let core = Self {
            tasks: Mutex::new(TaskTable::new()),
            stats: Mutex::new(Stats::new()),
            breaker: Mutex::new(RateLimitState::new(&config.breaker)),
            driver: Arc::new(PacedDriver::new(driver, &config.pacing, config.timeouts.clone())),
            events,
            admission: AdmissionController::new(&config.scheduler),
            cycle: CycleManager::new(ResetMode::from_reset_at_hour(config.scheduler.reset_at_hour)),
            health: HealthMonitor::new(&config.health),
            init_tx,
            notice_tx,
            inits: Mutex::new(JoinSet::new()),
            config,
        };
        let mailbox = Mailbox {
            events: inbox,
            inits,
            notices,
        };
        (core, mailbox)
    }

    /// Notifier handed to the driver at launch
    pub fn notifier(&self) -> DriverNotifier {
        DriverNotifier::new(self.notice_tx.clone(), self.driver.gate().clone())
    }

    /// Insert a new Pending task; duplicates are rejected
    pub async fn add_task(&self, id: TaskId, address: &str) -> bool {
        let inserted = self.tasks.lock().await.insert(Task::new(id, address));
        if inserted {
            tracing::info!(task_id = id, "Task added");
            self.events.trigger(SchedulerEvent::PageClosed);
        } else {
            tracing::warn!(task_id = id, "Duplicate task id ignored");
        }
        inserted
    }

    pub async fn try_admit_pending(&self) -> usize {
        self.admission.try_admit_pending(self).await
    }

    pub async fn finish_init(&self, done: InitFinished) {
        self.admission.finish_init(self, done).await;
    }

    pub async fn handle_notice(&self, notice: DriverNotice) {
        match notice {
            DriverNotice::SolutionSubmitted(task_id) => {
                let mut tasks = self.tasks.lock().await;
                let Some(task) = tasks.get_mut(task_id).filter(|t| t.status.owns_session()) else {
                    tracing::debug!(task_id, "Solution notice for a task with no live run");
                    return;
                };
                let mut stats = self.stats.lock().await;
                if credit_solution(task, &mut stats) {
                    tracing::info!(task_id, "Solution submitted");
                } else {
                    tracing::debug!(task_id, "Solution already credited for this run");
                }
            }
            DriverNotice::Throttled(task_id) => {
                tracing::warn!(task_id, "Driver reported throttling");
                self.driver.gate().record_throttled().await;
            }
        }
    }

    /// One scheduling step
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            rolled_over: self.cycle.check(self).await.is_some(),
            ..Default::default()
        };

        self.reap_inits().await;
        report.lost_sessions = self.reconcile_closed_sessions().await;
        report.force_closed = self.admission.enforce_open_page_ceiling(self).await;

        let probes = self.probe(self.due_for_poll().await).await;
        report.probed = probes.len();
        let mut budget = self.admission.click_budget(&*self.tasks.lock().await);
        for (id, generation, handle, status) in probes {
            if self.apply_probe(id, generation, handle, status, &mut budget).await {
                report.clicked += 1;
            }
        }

        report.stuck = self.health.fail_stuck(self).await;
        report.admitted = self.try_admit_pending().await;
        tracing::debug!(?report, "Tick");
        report
    }

    async fn reap_inits(&self) {
        let mut inits = self.inits.lock().await;
        while let Some(joined) = inits.try_join_next() {
            if let Err(e) = joined
                && e.is_panic()
            {
                tracing::error!(error = %e, "Session open task panicked");
            }
        }
    }

    /// Requeue live runs whose session the driver closed underneath us
    async fn reconcile_closed_sessions(&self) -> usize {
        let released: Vec<SessionHandle> = {
            let mut tasks = self.tasks.lock().await;
            let mut released = Vec::new();
            for task in tasks.iter_mut() {
                if !task.session.as_ref().is_some_and(|h| h.is_closed()) {
                    continue;
                }
                match task.status {
                    TaskStatus::Initializing | TaskStatus::Mining => {
                        tracing::warn!(task_id = task.id, status = %task.status, "Session closed unexpectedly");
                        released.extend(task.requeue(Some("session closed unexpectedly".to_string())));
                    }
                    // Completion closes these without a new session
                    TaskStatus::Completed | TaskStatus::WaitingClose => {}
                    _ => task.session = None,
                }
            }
            released
        };

        if released.is_empty() {
            return 0;
        }
        {
            let mut stats = self.stats.lock().await;
            for _ in &released {
                stats.record_failure();
            }
        }
        join_all(released.iter().map(|h| self.driver.dispose(h))).await;
        self.events.trigger(SchedulerEvent::PageClosed);
        released.len()
    }

    async fn due_for_poll(&self) -> Vec<(TaskId, u64, SessionHandle)> {
        let candidates: Vec<_> = {
            let tasks = self.tasks.lock().await;
            tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Initializing | TaskStatus::Mining))
                .filter_map(|t| {
                    let handle = t.session.clone().filter(|h| !h.is_closed())?;
                    Some((t.id, t.generation, handle))
                })
                .collect()
        };

        let gate = self.driver.gate();
        let mut due = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if gate.should_poll(candidate.0).await {
                due.push(candidate);
            }
        }
        due
    }

    async fn probe(&self, targets: Vec<(TaskId, u64, SessionHandle)>) -> Vec<(TaskId, u64, SessionHandle, DetectedStatus)> {
        join_all(targets.into_iter().map(|(id, generation, handle)| async move {
            let status = self.driver.detect_status(&handle).await;
            (id, generation, handle, status)
        }))
        .await
    }

    /// Fold one probe result into the task. Returns true if a start click
    /// was issued.
    async fn apply_probe(
        &self,
        id: TaskId,
        generation: u64,
        handle: SessionHandle,
        status: DetectedStatus,
        budget: &mut usize,
    ) -> bool {
        let cycle = self.cycle.current();
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|t| t.generation == generation) else {
            return false;
        };

        match status {
            DetectedStatus::StartReady => {
                if task.status == TaskStatus::Mining {
                    tracing::info!(task_id = id, "Miner dropped back to start control");
                    if let Err(e) = task.transition(TaskStatus::Initializing) {
                        tracing::warn!(task_id = id, error = %e, "Rejected transition");
                        return false;
                    }
                    task.start_click_count = 0;
                }
                let armed = task.start_click_count > 0;
                drop(tasks);
                if !armed {
                    if *budget == 0 {
                        tracing::debug!(task_id = id, "Start click deferred, mining ceiling reached");
                        return false;
                    }
                    *budget -= 1;
                }
                self.click_start(id, generation, &handle).await
            }
            DetectedStatus::Mining => {
                if task.status != TaskStatus::Initializing {
                    return false;
                }
                let may_start = self.admission.may_start_mining(&tasks);
                let Some(task) = tasks.get_mut(id) else {
                    return false;
                };
                if !may_start {
                    tracing::warn!(task_id = id, "Mining signal with ceiling reached");
                    self.events.trigger(SchedulerEvent::TaskStatusChanged);
                    return false;
                }
                match task.begin_mining(cycle) {
                    Ok(()) => {
                        tracing::info!(task_id = id, cycle = task.mining_cycle, "Mining started");
                        self.events.trigger(SchedulerEvent::TaskMiningStarted);
                    }
                    Err(e) => tracing::warn!(task_id = id, error = %e, "Rejected transition"),
                }
                false
            }
            DetectedStatus::Completed => {
                let mut stats = self.stats.lock().await;
                match complete_run(task, &mut stats, cycle) {
                    Ok(()) => {
                        tracing::info!(task_id = id, cycle, "Task completed");
                        drop(stats);
                        drop(tasks);
                        self.breaker.lock().await.record_success();
                        self.events.trigger(SchedulerEvent::TaskCompleted);
                    }
                    Err(e) => tracing::warn!(task_id = id, error = %e, "Rejected transition"),
                }
                false
            }
            DetectedStatus::Crashed => {
                drop(tasks);
                let action = self.health.crash_refresh(self, id, generation, &handle).await;
                tracing::debug!(task_id = id, ?action, "Crash refresh");
                false
            }
            DetectedStatus::Pending => {
                tracing::warn!(task_id = id, "Session lost its login, returning to pending");
                let released = task.requeue(Some("session lost its login".to_string()));
                drop(tasks);
                self.stats.lock().await.record_failure();
                if let Some(handle) = released {
                    self.driver.dispose(&handle).await;
                }
                self.events.trigger(SchedulerEvent::PageClosed);
                false
            }
            DetectedStatus::Error(reason) => {
                tracing::debug!(task_id = id, %reason, "Driver error during probe, state kept");
                task.last_error = Some(reason);
                false
            }
            DetectedStatus::Initializing | DetectedStatus::Throttled => false,
        }
    }

    /// Issue a start click and count the attempt
    async fn click_start(&self, id: TaskId, generation: u64, handle: &SessionHandle) -> bool {
        let result = self.driver.click_start(handle).await;
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|t| t.generation == generation) else {
            return false;
        };
        task.record_start_click();
        match result {
            Ok(()) => {
                tracing::debug!(task_id = id, clicks = task.start_click_count, "Start clicked");
                true
            }
            Err(e) => {
                tracing::warn!(task_id = id, error = %e, "Start click failed");
                task.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Click start on freshly opened sessions while mining capacity allows
    async fn click_ready_tasks(&self) -> usize {
        let targets: Vec<(TaskId, u64, SessionHandle)> = {
            let tasks = self.tasks.lock().await;
            let budget = self.admission.click_budget(&tasks);
            tasks
                .iter()
                .filter(|t| t.is_session_ready() && t.start_click_count == 0)
                .filter_map(|t| Some((t.id, t.generation, t.session.clone()?)))
                .take(budget)
                .collect()
        };

        let mut clicked = 0;
        for (id, generation, handle) in targets {
            if self.click_start(id, generation, &handle).await {
                clicked += 1;
            }
        }
        clicked
    }

    /// Dispose and close every completed run
    async fn close_completed(&self) -> usize {
        let closing: Vec<(TaskId, u64, Option<SessionHandle>)> = {
            let mut tasks = self.tasks.lock().await;
            let mut stats = self.stats.lock().await;
            let mut closing = Vec::new();
            for task in tasks.iter_mut() {
                match task.status {
                    TaskStatus::Completed => {
                        if let Err(e) = task.transition(TaskStatus::WaitingClose) {
                            tracing::warn!(task_id = task.id, error = %e, "Rejected transition");
                            continue;
                        }
                        stats.record_success();
                    }
                    TaskStatus::WaitingClose => {}
                    _ => continue,
                }
                closing.push((task.id, task.generation, task.take_session()));
            }
            closing
        };

        if closing.is_empty() {
            return 0;
        }
        join_all(closing.iter().filter_map(|(_, _, h)| h.as_ref()).map(|h| self.driver.dispose(h))).await;

        {
            let mut tasks = self.tasks.lock().await;
            for (id, generation, _) in &closing {
                let Some(task) = tasks
                    .get_mut(*id)
                    .filter(|t| t.generation == *generation && t.status == TaskStatus::WaitingClose)
                else {
                    continue;
                };
                match task.transition(TaskStatus::Closed) {
                    Ok(_) => tracing::info!(task_id = id, "Session closed"),
                    Err(e) => tracing::warn!(task_id = id, error = %e, "Rejected transition"),
                }
            }
        }

        self.breaker.lock().await.record_success();
        self.events.trigger(SchedulerEvent::PageClosed);
        closing.len()
    }

    /// Release every session after the actor has stopped
    pub async fn shutdown_sessions(&self, mailbox: &mut Mailbox) -> usize {
        {
            let mut inits = self.inits.lock().await;
            let drained = tokio::time::timeout(self.config.timeouts.init(), async {
                while inits.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(in_flight = inits.len(), "Aborting session opens still in flight");
                inits.abort_all();
                while inits.join_next().await.is_some() {}
            }
        }

        let mut released = Vec::new();
        while let Ok(done) = mailbox.inits.try_recv() {
            released.extend(done.result.ok());
        }

        {
            let mut tasks = self.tasks.lock().await;
            let mut stats = self.stats.lock().await;
            for task in tasks.iter_mut() {
                match task.status {
                    TaskStatus::Initializing | TaskStatus::Mining => {
                        released.extend(task.requeue(None));
                    }
                    TaskStatus::Completed | TaskStatus::WaitingClose => {
                        if task.status == TaskStatus::Completed {
                            stats.record_success();
                            let _ = task.transition(TaskStatus::WaitingClose);
                        }
                        released.extend(task.take_session());
                        let _ = task.transition(TaskStatus::Closed);
                    }
                    _ => released.extend(task.take_session()),
                }
            }
        }

        join_all(released.iter().map(|h| self.driver.dispose(h))).await;
        let dropped = mailbox.events.clear();
        while mailbox.notices.try_recv().is_ok() {}
        tracing::info!(disposed = released.len(), dropped_events = dropped, "Sessions released");
        released.len()
    }

    pub async fn snapshot(&self, running: bool) -> SchedulerSnapshot {
        let tasks = self.tasks.lock().await;
        let stats = self.stats.lock().await;
        let breaker = self.breaker.lock().await;
        let inits_in_flight = self.inits.lock().await.len();
        let as_ms = |d: Duration| d.as_millis() as u64;

        SchedulerSnapshot {
            running,
            cycle: self.cycle.current(),
            cycle_started_at: self.cycle.started_at().await,
            reset_mode: self.cycle.mode(),
            tasks: tasks.counts(),
            open_pages: admission::count_open_pages(&tasks),
            max_open_pages: self.config.scheduler.max_open_pages,
            active_mining: admission::active_mining_count(&tasks),
            max_active_mining: self.config.scheduler.max_active_mining,
            initializing: tasks.count_status(TaskStatus::Initializing),
            page_open_concurrency: self.config.scheduler.page_open_concurrency,
            sessions_ready: admission::sessions_ready(&tasks),
            success: stats.success,
            failed: stats.failed,
            submitted_solutions: stats.submitted_solutions,
            submitted_in_cycle: stats.submitted_in_cycle,
            avg_login_latency_ms: stats.avg_login_latency().map(as_ms),
            avg_mining_latency_ms: stats.avg_mining_latency().map(as_ms),
            login_samples: stats.login_latencies.len(),
            mining_samples: stats.mining_latencies.len(),
            consecutive_throttled: breaker.consecutive_throttled,
            admission_paused_ms: breaker.remaining_pause().map(as_ms),
            navigation_interval_ms: as_ms(self.driver.limiter().current_interval().await),
            poll_interval_ms: as_ms(self.driver.gate().poll_interval().await),
            submissions_in_flight: self.driver.gate().submissions_in_flight(),
            inits_in_flight,
        }
    }
}

#[async_trait]
impl<D: TaskDriver + 'static> EventHandler for SchedulerCore<D> {
    async fn handle(&self, event: SchedulerEvent) -> Result<()> {
        tracing::debug!(%event, "Handling event");
        match event {
            SchedulerEvent::PageClosed => {
                self.try_admit_pending().await;
            }
            SchedulerEvent::TaskInitialized => {
                self.click_ready_tasks().await;
                self.try_admit_pending().await;
            }
            SchedulerEvent::TaskStatusChanged => {
                self.admission.enforce_active_mining_ceiling(self).await;
            }
            SchedulerEvent::TaskMiningStarted => {
                self.admission.enforce_active_mining_ceiling(self).await;
                self.try_admit_pending().await;
            }
            SchedulerEvent::TaskCompleted => {
                self.close_completed().await;
            }
            SchedulerEvent::TaskError => {
                self.health.recover_errored(self).await;
            }
        }
        Ok(())
    }
}
