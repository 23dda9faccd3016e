//! minerd - admission-controlled scheduler for long-lived mining sessions
//!
//! Tasks move through a small state machine while a single actor admits them
//! under open-page and active-mining ceilings, reacts to driver events, rolls
//! cycles over every hour and recovers unhealthy sessions. The browser-level
//! work is behind the [`driver::TaskDriver`] trait.

pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod id;
pub mod scheduler;

pub use error::{MinerError, Result};
pub use scheduler::{Scheduler, SchedulerSnapshot};
