//! Admission-controlled, event-driven task scheduler.
//!
//! This module provides:
//! - **Pacing**: [`RateLimiter`] spaces navigation-class driver calls and
//!   [`SubmissionGate`] holds polling back while a submission is in flight.
//!   [`PacedDriver`] routes every driver call through them.
//! - **Admission**: promotes Pending tasks under the open-page and
//!   session-open ceilings and stops excess miners.
//! - **Events**: coalescing, re-entrant-safe processing passes.
//! - **Cycles**: hourly rollover with hard or soft reset.
//! - **Health**: reload-based recovery, crash refresh and stuck detection.
//! - **Scheduler**: the public start/stop/add_task/status surface and the
//!   actor that ties the above together.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use minerd::config::GlobalConfig;
//! use minerd::driver::SimulatedDriver;
//! use minerd::scheduler::Scheduler;
//!
//! let config = GlobalConfig::default();
//! let driver = Arc::new(SimulatedDriver::new(&config.simulation));
//! let scheduler = Scheduler::new(config, driver);
//! scheduler.add_task(0, "addr0").await;
//! scheduler.start().await?;
//! ```

mod admission;
mod core;
mod cycle;
mod events;
pub mod gate;
mod health;
pub mod limiter;
mod manager;
mod paced;
pub mod rate_limit;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{active_mining_count, count_open_pages, open_page_count, sessions_ready};
pub use self::core::{SchedulerSnapshot, TickReport};
pub use cycle::{ResetMode, ResetReport, hour_index};
pub use events::{EventDispatcher, EventHandler, EventInbox, PassStats, SchedulerEvent};
pub use gate::{GateOutcome, SubmissionGate, SubmissionGuard};
pub use health::{CrashAction, HealthReport};
pub use limiter::{AdaptiveInterval, RateLimiter};
pub use manager::Scheduler;
pub use paced::PacedDriver;
pub use rate_limit::RateLimitState;
