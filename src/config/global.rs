//! Global configuration.
//!
//! Loaded from ~/.config/minerd/minerd.yml or .minerd.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for minerd.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log level used when RUST_LOG is not set.
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Capacity ceilings and tick cadence.
    pub scheduler: SchedulerConfig,

    /// Adaptive pacing of driver calls.
    pub pacing: PacingConfig,

    /// Admission circuit breaker.
    pub breaker: BreakerConfig,

    /// Health monitor and crash recovery.
    pub health: HealthConfig,

    /// Bounded driver operation timeouts.
    pub timeouts: TimeoutConfig,

    /// Timings for the simulated driver.
    pub simulation: SimulationConfig,
}

impl GlobalConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .minerd.yml in current directory
    /// 3. ~/.config/minerd/minerd.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(".minerd.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .minerd.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .minerd.yml: {}", e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("minerd").join("minerd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub(crate) fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.max_active_mining == 0 {
            eyre::bail!("scheduler.max-active-mining must be > 0");
        }
        if s.max_open_pages == 0 {
            eyre::bail!("scheduler.max-open-pages must be > 0");
        }
        if s.page_open_concurrency == 0 {
            eyre::bail!("scheduler.page-open-concurrency must be > 0");
        }
        if s.page_open_concurrency > s.max_open_pages {
            eyre::bail!("scheduler.page-open-concurrency must not exceed scheduler.max-open-pages");
        }
        if s.status_check_interval_ms == 0 {
            eyre::bail!("scheduler.status-check-interval-ms must be > 0");
        }
        for (name, interval) in [("navigation", &self.pacing.navigation), ("polling", &self.pacing.polling)] {
            if interval.base_ms == 0 || interval.max_ms < interval.base_ms {
                eyre::bail!("pacing.{name}: base-ms must be > 0 and <= max-ms");
            }
            if interval.multiplier < 1.0 {
                eyre::bail!("pacing.{name}.multiplier must be >= 1.0");
            }
        }
        if self.breaker.max_consecutive == 0 {
            eyre::bail!("breaker.max-consecutive must be > 0");
        }
        Ok(())
    }
}

/// Capacity ceilings and tick cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sessions allowed in the timed mining phase at once.
    #[serde(rename = "max-active-mining")]
    pub max_active_mining: usize,

    /// Sessions allowed open at once.
    #[serde(rename = "max-open-pages")]
    pub max_open_pages: usize,

    /// Sessions allowed in Initializing at once.
    #[serde(rename = "page-open-concurrency")]
    pub page_open_concurrency: usize,

    /// Tick cadence in milliseconds.
    #[serde(rename = "status-check-interval-ms")]
    pub status_check_interval_ms: u64,

    /// Hard reset at the hourly rollover (false selects soft reset).
    #[serde(rename = "reset-at-hour")]
    pub reset_at_hour: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_mining: 6,
            max_open_pages: 12,
            page_open_concurrency: 4,
            status_check_interval_ms: 5_000,
            reset_at_hour: true,
        }
    }
}

impl SchedulerConfig {
    pub fn status_check_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_ms)
    }
}

/// One adaptive interval: multiplied up on throttling, stepped back down after
/// a quiet window.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntervalConfig {
    #[serde(rename = "base-ms")]
    pub base_ms: u64,

    #[serde(rename = "max-ms")]
    pub max_ms: u64,

    pub multiplier: f64,

    /// Throttle-free time required before each step back toward base.
    #[serde(rename = "recovery-ms")]
    pub recovery_ms: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            recovery_ms: 60_000,
        }
    }
}

impl IntervalConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }
}

/// Adaptive pacing of driver calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Minimum spacing between navigation-class calls.
    pub navigation: IntervalConfig,

    /// Minimum spacing between polls of the same task.
    pub polling: IntervalConfig,

    /// Longest a poll waits behind an in-flight submission.
    #[serde(rename = "submission-max-wait-ms")]
    pub submission_max_wait_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            navigation: IntervalConfig::default(),
            polling: IntervalConfig {
                base_ms: 2_000,
                max_ms: 60_000,
                multiplier: 2.0,
                recovery_ms: 60_000,
            },
            submission_max_wait_ms: 30_000,
        }
    }
}

impl PacingConfig {
    pub fn submission_max_wait(&self) -> Duration {
        Duration::from_millis(self.submission_max_wait_ms)
    }
}

/// Admission circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive throttled admissions that trip the breaker.
    #[serde(rename = "max-consecutive")]
    pub max_consecutive: u32,

    /// How long admission stays paused once tripped.
    #[serde(rename = "cooldown-ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive: 3,
            cooldown_ms: 300_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Health monitor and crash recovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Minimum spacing between health sweeps.
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,

    /// Page refreshes allowed before a crashing task is promoted to Error.
    #[serde(rename = "max-crash-refreshes")]
    pub max_crash_refreshes: u32,

    /// Minimum spacing between two refreshes of the same task.
    #[serde(rename = "crash-refresh-spacing-ms")]
    pub crash_refresh_spacing_ms: u64,

    /// Refresh attempts older than this no longer count.
    #[serde(rename = "crash-refresh-window-ms")]
    pub crash_refresh_window_ms: u64,

    /// Start clicks tolerated before an Initializing task is suspect.
    #[serde(rename = "stuck-click-threshold")]
    pub stuck_click_threshold: u32,

    /// Time since the last click after which a suspect task is promoted to Error.
    #[serde(rename = "stuck-after-ms")]
    pub stuck_after_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_crash_refreshes: 3,
            crash_refresh_spacing_ms: 3_000,
            crash_refresh_window_ms: 300_000,
            stuck_click_threshold: 5,
            stuck_after_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn crash_refresh_spacing(&self) -> Duration {
        Duration::from_millis(self.crash_refresh_spacing_ms)
    }

    pub fn crash_refresh_window(&self) -> Duration {
        Duration::from_millis(self.crash_refresh_window_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }
}

/// Bounded driver operation timeouts. Waiting for mining to complete has no
/// timeout; it is governed by the cycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(rename = "init-ms")]
    pub init_ms: u64,

    #[serde(rename = "click-ms")]
    pub click_ms: u64,

    #[serde(rename = "health-ms")]
    pub health_ms: u64,

    #[serde(rename = "reload-ms")]
    pub reload_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_ms: 120_000,
            click_ms: 15_000,
            health_ms: 20_000,
            reload_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn click(&self) -> Duration {
        Duration::from_millis(self.click_ms)
    }

    pub fn health(&self) -> Duration {
        Duration::from_millis(self.health_ms)
    }

    pub fn reload(&self) -> Duration {
        Duration::from_millis(self.reload_ms)
    }
}

/// Timings for the simulated driver used by `minerd run`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time to open a session.
    #[serde(rename = "init-ms")]
    pub init_ms: u64,

    /// Delay between a start click and the mining signal.
    #[serde(rename = "start-delay-ms")]
    pub start_delay_ms: u64,

    /// Length of the timed mining phase.
    #[serde(rename = "mining-ms")]
    pub mining_ms: u64,

    /// Every Nth session crashes once while mining (0 disables).
    #[serde(rename = "crash-every")]
    pub crash_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            init_ms: 2_000,
            start_delay_ms: 1_000,
            mining_ms: 60_000,
            crash_every: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.scheduler.max_active_mining, 6);
        assert_eq!(config.scheduler.max_open_pages, 12);
        assert_eq!(config.scheduler.page_open_concurrency, 4);
        assert_eq!(config.scheduler.status_check_interval(), Duration::from_secs(5));
        assert!(config.scheduler.reset_at_hour);
        assert_eq!(config.breaker.max_consecutive, 3);
        assert_eq!(config.health.max_crash_refreshes, 3);
        assert_eq!(config.health.crash_refresh_spacing(), Duration::from_secs(3));
    }

    #[test]
    fn test_config_validation() {
        let config = GlobalConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_zero_ceiling() {
        let config = GlobalConfig {
            scheduler: SchedulerConfig {
                max_open_pages: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_concurrency_above_ceiling() {
        let config = GlobalConfig {
            scheduler: SchedulerConfig {
                max_open_pages: 2,
                page_open_concurrency: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
scheduler:
  max-open-pages: 3
  page-open-concurrency: 2
  reset-at-hour: false
breaker:
  cooldown-ms: 1000
"#;
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.max_open_pages, 3);
        assert_eq!(config.scheduler.page_open_concurrency, 2);
        assert!(!config.scheduler.reset_at_hour);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(1));
        // Other fields should have defaults
        assert_eq!(config.scheduler.max_active_mining, 6);
        assert_eq!(config.health.stuck_click_threshold, 5);
    }
}
