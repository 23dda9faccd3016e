//! Environment overrides.
//!
//! The recognized option names (`MAX_ACTIVE_MINING`, `MAX_OPEN_PAGES`,
//! `PAGE_OPEN_CONCURRENCY`, `STATUS_CHECK_INTERVAL`, `RESET_AT_HOUR`) override
//! whatever the config file says.

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};

use super::global::GlobalConfig;

pub const ENV_MAX_ACTIVE_MINING: &str = "MAX_ACTIVE_MINING";
pub const ENV_MAX_OPEN_PAGES: &str = "MAX_OPEN_PAGES";
pub const ENV_PAGE_OPEN_CONCURRENCY: &str = "PAGE_OPEN_CONCURRENCY";
pub const ENV_STATUS_CHECK_INTERVAL: &str = "STATUS_CHECK_INTERVAL";
pub const ENV_RESET_AT_HOUR: &str = "RESET_AT_HOUR";

/// Overrides parsed from the environment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EnvOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_mining: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_open_pages: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_open_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_check_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at_hour: Option<bool>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            max_active_mining: get(ENV_MAX_ACTIVE_MINING)
                .map(|v| parse_count(ENV_MAX_ACTIVE_MINING, &v))
                .transpose()?,
            max_open_pages: get(ENV_MAX_OPEN_PAGES)
                .map(|v| parse_count(ENV_MAX_OPEN_PAGES, &v))
                .transpose()?,
            page_open_concurrency: get(ENV_PAGE_OPEN_CONCURRENCY)
                .map(|v| parse_count(ENV_PAGE_OPEN_CONCURRENCY, &v))
                .transpose()?,
            status_check_interval_ms: get(ENV_STATUS_CHECK_INTERVAL)
                .map(|v| parse_duration_ms(ENV_STATUS_CHECK_INTERVAL, &v))
                .transpose()?,
            reset_at_hour: get(ENV_RESET_AT_HOUR)
                .map(|v| parse_bool(ENV_RESET_AT_HOUR, &v))
                .transpose()?,
        })
    }

    /// Check if any overrides are set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the overrides on top of a loaded config.
    pub fn apply(&self, config: &mut GlobalConfig) {
        let s = &mut config.scheduler;
        if let Some(v) = self.max_active_mining {
            s.max_active_mining = v;
        }
        if let Some(v) = self.max_open_pages {
            s.max_open_pages = v;
        }
        if let Some(v) = self.page_open_concurrency {
            s.page_open_concurrency = v;
        }
        if let Some(v) = self.status_check_interval_ms {
            s.status_check_interval_ms = v;
        }
        if let Some(v) = self.reset_at_hour {
            s.reset_at_hour = v;
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| eyre!("{key}: expected a non-negative integer, got '{value}'"))
}

/// Accepts plain milliseconds (`5000`) or a unit suffix (`500ms`, `5s`).
fn parse_duration_ms(key: &str, value: &str) -> Result<u64> {
    let (digits, scale) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, 1_000)
    } else {
        (value, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| eyre!("{key}: expected a duration like 5000, 500ms or 5s, got '{value}'"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(eyre!("{key}: expected true or false, got '{value}'")),
    }
}
