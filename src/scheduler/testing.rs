//! Helpers for driving a [`SchedulerCore`] by hand in unit tests.

use std::sync::Arc;

use crate::config::{GlobalConfig, IntervalConfig};
use crate::domain::{TaskId, TaskStatus};
use crate::driver::{MockDriver, TaskDriver};
use crate::scheduler::core::{Mailbox, SchedulerCore};

fn instant_interval() -> IntervalConfig {
    IntervalConfig {
        base_ms: 0,
        max_ms: 0,
        multiplier: 2.0,
        recovery_ms: 0,
    }
}

/// No pacing delays, every probe due, no crash-refresh spacing
pub fn test_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.pacing.navigation = instant_interval();
    config.pacing.polling = instant_interval();
    config.pacing.submission_max_wait_ms = 50;
    config.health.interval_ms = 0;
    config.health.crash_refresh_spacing_ms = 0;
    config
}

pub fn core_with(config: GlobalConfig, tasks: u64) -> (Arc<MockDriver>, SchedulerCore<MockDriver>, Mailbox) {
    let mock = Arc::new(MockDriver::new());
    let (core, mailbox) = SchedulerCore::new(config, mock.clone());
    for id in 0..tasks {
        core.tasks.try_lock().expect("fresh table").insert(crate::domain::Task::new(id, format!("addr{}", id)));
    }
    (mock, core, mailbox)
}

/// Run everything the actor would until nothing is left to do
pub async fn settle<D: TaskDriver + 'static>(core: &SchedulerCore<D>, mailbox: &mut Mailbox) {
    loop {
        {
            let mut inits = core.inits.lock().await;
            while inits.join_next().await.is_some() {}
        }

        let mut progressed = false;
        while let Ok(done) = mailbox.inits.try_recv() {
            core.finish_init(done).await;
            progressed = true;
        }
        while let Ok(notice) = mailbox.notices.try_recv() {
            core.handle_notice(notice).await;
            progressed = true;
        }
        if mailbox.events.process_queued(core).await.is_some() {
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}

pub async fn status_of<D: TaskDriver + 'static>(core: &SchedulerCore<D>, id: TaskId) -> TaskStatus {
    core.tasks.lock().await.get(id).expect("task exists").status
}
