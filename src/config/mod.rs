//! Configuration system for minerd.
//!
//! Two layers:
//! 1. Config file (explicit path, .minerd.yml or ~/.config/minerd/minerd.yml)
//! 2. Environment overrides for the recognized scheduler options

use eyre::{Context, Result};
use std::path::PathBuf;

pub use self::global::{
    BreakerConfig, GlobalConfig, HealthConfig, IntervalConfig, PacingConfig, SchedulerConfig, SimulationConfig,
    TimeoutConfig,
};
pub use self::overrides::EnvOverrides;

mod global;
mod overrides;

/// Load configuration from the standard search paths, apply environment
/// overrides and validate the result.
pub fn load_config(explicit_path: Option<&PathBuf>) -> Result<GlobalConfig> {
    let mut config = GlobalConfig::load(explicit_path)?;
    let overrides = EnvOverrides::from_env().context("Invalid environment override")?;
    if !overrides.is_empty() {
        log::info!("Applying environment overrides: {:?}", overrides);
        overrides.apply(&mut config);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_explicit_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "scheduler:\n  max-active-mining: 2\n  max-open-pages: 4").unwrap();

        let config = GlobalConfig::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.scheduler.max_active_mining, 2);
        assert_eq!(config.scheduler.max_open_pages, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/minerd.yml");
        assert!(GlobalConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "scheduler: [not, a, map]").unwrap();
        assert!(GlobalConfig::load(Some(&file.path().to_path_buf())).is_err());
    }
}
