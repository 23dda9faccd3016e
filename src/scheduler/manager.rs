//! Scheduler - the public lifecycle surface.
//!
//! `start()` launches the driver and spawns the actor that owns the
//! [`Mailbox`]. The actor multiplexes, one at a time:
//! 1. session-open results
//! 2. out-of-band driver notices
//! 3. event passes
//! 4. the status tick (`status-check-interval-ms`)
//! 5. the health sweep (`health.interval-ms`)
//!
//! `stop()` cancels the actor, takes its mailbox back, releases every session
//! and shuts the driver down last.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::GlobalConfig;
use crate::domain::TaskId;
use crate::driver::TaskDriver;
use crate::error::{MinerError, Result};
use crate::scheduler::core::{Mailbox, SchedulerCore, SchedulerSnapshot};

struct Runtime {
    cancel: CancellationToken,
    actor: JoinHandle<Mailbox>,
}

#[derive(Default)]
struct Lifecycle {
    runtime: Option<Runtime>,
    mailbox: Option<Mailbox>,
}

/// Admission-controlled scheduler over a [`TaskDriver`]
pub struct Scheduler<D: TaskDriver + 'static> {
    core: Arc<SchedulerCore<D>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<D: TaskDriver + 'static> Scheduler<D> {
    pub fn new(config: GlobalConfig, driver: Arc<D>) -> Self {
        let (core, mailbox) = SchedulerCore::new(config, driver);
        Self {
            core: Arc::new(core),
            lifecycle: Mutex::new(Lifecycle {
                runtime: None,
                mailbox: Some(mailbox),
            }),
        }
    }

    /// Launch the driver and start the actor.
    ///
    /// Driver launch failure is the only fatal error and is returned as-is.
    pub async fn start(&self) -> Result<()> {
        // Waits behind an in-progress start or stop
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.runtime.is_some() {
            return Err(MinerError::AlreadyRunning);
        }
        let Some(mailbox) = lifecycle.mailbox.take() else {
            return Err(MinerError::ActorLost);
        };

        if let Err(e) = self.core.driver.launch(self.core.notifier()).await {
            lifecycle.mailbox = Some(mailbox);
            tracing::error!(error = %e, "Driver launch failed");
            return Err(MinerError::DriverLaunch(e));
        }

        let cancel = CancellationToken::new();
        let actor = tokio::spawn(run_actor(self.core.clone(), mailbox, cancel.clone()));
        lifecycle.runtime = Some(Runtime { cancel, actor });

        let config = &self.core.config.scheduler;
        tracing::info!(
            max_active_mining = config.max_active_mining,
            max_open_pages = config.max_open_pages,
            page_open_concurrency = config.page_open_concurrency,
            interval_ms = config.status_check_interval_ms,
            mode = ?self.core.cycle.mode(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the actor, dispose every session and shut the driver down.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(runtime) = lifecycle.runtime.take() else {
            return Err(MinerError::NotRunning);
        };

        runtime.cancel.cancel();
        let mut mailbox = match runtime.actor.await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                tracing::error!(error = %e, "Scheduler actor terminated abnormally");
                self.core.driver.shutdown().await;
                return Err(MinerError::ActorLost);
            }
        };

        self.core.shutdown_sessions(&mut mailbox).await;
        self.core.driver.shutdown().await;
        lifecycle.mailbox = Some(mailbox);
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.runtime.is_some()
    }

    /// Add a Pending task. A duplicate id is a logged no-op returning false.
    pub async fn add_task(&self, id: TaskId, address: impl AsRef<str>) -> bool {
        self.core.add_task(id, address.as_ref()).await
    }

    pub async fn status(&self) -> SchedulerSnapshot {
        let running = self.is_running().await;
        self.core.snapshot(running).await
    }
}

async fn run_actor<D: TaskDriver + 'static>(
    core: Arc<SchedulerCore<D>>,
    mut mailbox: Mailbox,
    cancel: CancellationToken,
) -> Mailbox {
    // tokio rejects a zero period
    let floor = Duration::from_millis(1);
    let mut tick = tokio::time::interval(core.config.scheduler.status_check_interval().max(floor));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut health = tokio::time::interval(core.health.interval().max(floor));
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately; let the first status tick come first
    health.reset();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(done) = mailbox.inits.recv() => core.finish_init(done).await,
            Some(notice) = mailbox.notices.recv() => core.handle_notice(notice).await,
            Some(event) = mailbox.events.recv() => {
                mailbox.events.process(event, core.as_ref()).await;
            }
            _ = tick.tick() => {
                core.tick().await;
            }
            _ = health.tick() => {
                core.health.run(core.as_ref()).await;
            }
        }
    }

    tracing::debug!("Scheduler actor exiting");
    mailbox
}
