//! Subscription manager configuration.
//!
//! Loaded from TOML at:
//! - Linux: ~/.config/realtime-sync/config.toml
//! - macOS: ~/Library/Application Support/realtime-sync/config.toml
//! - Windows: %APPDATA%\realtime-sync\config.toml
//!
//! Every section is optional; missing keys fall back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};

const CONFIG_DIR_NAME: &str = "realtime-sync";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RealtimeConfig {
    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Liveness probe, staleness sweep and signal handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Reachability probe cadence
    pub probe_interval_secs: u64,
    /// Staleness sweep cadence
    pub sweep_interval_secs: u64,
    /// Debounce between a network-up signal and the reconnection pass
    pub settle_delay_ms: u64,
    /// High-priority subscriptions idle longer than this are stale
    pub high_priority_stale_secs: u64,
    /// No user activity for this long triggers a reconnection pass
    pub global_inactivity_secs: u64,
    /// Foreground gaps longer than this invalidate the whole cache
    pub foreground_refresh_secs: u64,
    /// Consecutive probe failures before flipping to disconnected
    pub probe_failure_threshold: u32,
    /// Consecutive probe successes before flipping back to connected
    pub probe_success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
            sweep_interval_secs: 60,
            settle_delay_ms: 2_000,
            high_priority_stale_secs: 5 * 60,
            global_inactivity_secs: 30 * 60,
            foreground_refresh_secs: 2 * 60,
            probe_failure_threshold: 2,
            probe_success_threshold: 2,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn high_priority_stale_after(&self) -> Duration {
        Duration::from_secs(self.high_priority_stale_secs)
    }

    pub fn global_inactivity_after(&self) -> Duration {
        Duration::from_secs(self.global_inactivity_secs)
    }

    pub fn foreground_refresh_after(&self) -> Duration {
        Duration::from_secs(self.foreground_refresh_secs)
    }
}

/// Reconnection delays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before reconnecting a channel that reported an error
    pub channel_error_delay_ms: u64,
    /// Delay before retrying a rebind that failed
    pub retry_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            channel_error_delay_ms: 5_000,
            retry_delay_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    pub fn channel_error_delay(&self) -> Duration {
        Duration::from_millis(self.channel_error_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RealtimeConfig {
    /// Default config file location, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| RealtimeError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would spin timers or never trip thresholds
    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("health.probe_interval_secs", self.health.probe_interval_secs),
            ("health.sweep_interval_secs", self.health.sweep_interval_secs),
            (
                "health.high_priority_stale_secs",
                self.health.high_priority_stale_secs,
            ),
            (
                "health.global_inactivity_secs",
                self.health.global_inactivity_secs,
            ),
            (
                "health.probe_failure_threshold",
                u64::from(self.health.probe_failure_threshold),
            ),
            (
                "health.probe_success_threshold",
                u64::from(self.health.probe_success_threshold),
            ),
        ];
        for (key, value) in zero_checks {
            if value == 0 {
                return Err(RealtimeError::Config {
                    message: format!("{} must be greater than zero", key),
                });
            }
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.as_str()) {
            return Err(RealtimeError::Config {
                message: format!(
                    "Invalid log level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level
                ),
            });
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RealtimeError::Config {
            message: format!("Failed to serialize config: {}", e),
        })
    }
}
