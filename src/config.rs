//! Configuration management for pmucal.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (PMUCAL_TABLE, PMUCAL_WAIT_ITERATIONS, etc.)
//! 2. Project-local config file (`./pmucal.toml`)
//! 3. User config file (`~/.config/pmucal/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # pmucal.toml
//!
//! # PMU sequence table (defaults to the compiled-in demo table)
//! table = "/etc/pmucal/exynos9820.toml"
//!
//! # Polling budgets
//! wait_iterations = 2000
//! retry_iterations = 1000
//! cp_iterations = 1000
//! poll_interval_us = 1
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::pmucal::{PollBudget, PollConfig};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// pmucal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Path to the PMU sequence table.
    pub table: Option<String>,

    /// Poll budget of Wait-class steps.
    pub wait_iterations: Option<u32>,

    /// Attempt budget of WriteRetry steps.
    pub retry_iterations: Option<u32>,

    /// Poll budget of the coprocessor status wait.
    pub cp_iterations: Option<u32>,

    /// Delay between polls, in microseconds.
    pub poll_interval_us: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `pmucal.toml`
    /// 3. User config `~/.config/pmucal/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Table path, if one is configured.
    pub fn table_path(&self) -> Option<PathBuf> {
        self.table.as_ref().map(PathBuf::from)
    }

    /// Polling budgets, with defaults for anything not configured.
    pub fn poll_config(&self) -> PollConfig {
        let defaults = PollConfig::default();
        let interval = |d: PollBudget| self.poll_interval_us.unwrap_or(d.poll_interval_us);
        PollConfig {
            wait: PollBudget::new(
                self.wait_iterations.unwrap_or(defaults.wait.max_iterations),
                interval(defaults.wait),
            ),
            write_retry: PollBudget::new(
                self.retry_iterations.unwrap_or(defaults.write_retry.max_iterations),
                interval(defaults.write_retry),
            ),
            cp_status: PollBudget::new(
                self.cp_iterations.unwrap_or(defaults.cp_status.max_iterations),
                interval(defaults.cp_status),
            ),
        }
    }

    /// Load user configuration from ~/.config/pmucal/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./pmucal.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("pmucal.toml"))
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.table.is_some() {
            self.table = other.table;
        }
        if other.wait_iterations.is_some() {
            self.wait_iterations = other.wait_iterations;
        }
        if other.retry_iterations.is_some() {
            self.retry_iterations = other.retry_iterations;
        }
        if other.cp_iterations.is_some() {
            self.cp_iterations = other.cp_iterations;
        }
        if other.poll_interval_us.is_some() {
            self.poll_interval_us = other.poll_interval_us;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("PMUCAL_TABLE") {
            log::info!("Using PMUCAL_TABLE from environment: {}", path);
            self.table = Some(path);
        }
        let number = |key: &str| -> Option<u32> {
            let text = var(key)?;
            match parse_u32(&text) {
                Some(n) => {
                    log::info!("Using {} from environment: {}", key, n);
                    Some(n)
                }
                None => {
                    log::warn!("Ignoring {}: '{}' is not a number", key, text);
                    None
                }
            }
        };
        if let Some(n) = number("PMUCAL_WAIT_ITERATIONS") {
            self.wait_iterations = Some(n);
        }
        if let Some(n) = number("PMUCAL_RETRY_ITERATIONS") {
            self.retry_iterations = Some(n);
        }
        if let Some(n) = number("PMUCAL_CP_ITERATIONS") {
            self.cp_iterations = Some(n);
        }
        if let Some(n) = number("PMUCAL_POLL_INTERVAL_US") {
            self.poll_interval_us = Some(n);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pmucal").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# pmucal configuration
# Place this file at ~/.config/pmucal/config.toml or ./pmucal.toml

# PMU sequence table (optional, defaults to the compiled-in demo table)
# table = "/etc/pmucal/exynos9820.toml"

# Poll budget of WAIT / WAIT_TWO / WRITE_WAIT steps
wait_iterations = 2000

# Attempt budget of WRITE_RETRY / WRITE_RETRY_INV steps
retry_iterations = 1000

# Poll budget of the coprocessor status wait
cp_iterations = 1000

# Busy-wait between polls, in microseconds
poll_interval_us = 1
"#
        .to_string()
    }
}

/// Parse a decimal or `0x` hexadecimal number.
fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_poll_config() {
        let config = Config::default();
        assert_eq!(config.poll_config(), PollConfig::default());
        assert_eq!(config.poll_config().wait.max_iterations, 2000);
        assert_eq!(config.poll_config().write_retry.max_iterations, 1000);
        assert!(config.table_path().is_none());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            table: Some("/base/table.toml".to_string()),
            wait_iterations: Some(100),
            retry_iterations: None,
            cp_iterations: Some(50),
            poll_interval_us: None,
        };

        let overlay = Config {
            table: None,
            wait_iterations: Some(300),
            retry_iterations: Some(20),
            cp_iterations: None,
            poll_interval_us: None,
        };

        base.merge(overlay);

        // table unchanged (overlay was None)
        assert_eq!(base.table, Some("/base/table.toml".to_string()));
        // wait_iterations overridden by overlay
        assert_eq!(base.wait_iterations, Some(300));
        // retry_iterations set from overlay
        assert_eq!(base.retry_iterations, Some(20));
        assert_eq!(base.cp_iterations, Some(50));
    }

    #[test]
    fn test_poll_config_from_fields() {
        let config = Config {
            wait_iterations: Some(10),
            poll_interval_us: Some(5),
            ..Config::default()
        };
        let poll = config.poll_config();
        assert_eq!(poll.wait, PollBudget::new(10, 5));
        assert_eq!(poll.write_retry, PollBudget::new(1000, 5));
        assert_eq!(poll.cp_status, PollBudget::new(1000, 5));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "PMUCAL_TABLE" => Some("/tmp/t.toml".to_string()),
            "PMUCAL_WAIT_ITERATIONS" => Some("0x40".to_string()),
            "PMUCAL_CP_ITERATIONS" => Some("many".to_string()),
            _ => None,
        });
        assert_eq!(config.table_path(), Some(PathBuf::from("/tmp/t.toml")));
        assert_eq!(config.wait_iterations, Some(64));
        assert_eq!(config.cp_iterations, None);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.poll_config(), PollConfig::default());
    }
}
