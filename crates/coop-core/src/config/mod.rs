//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file
//! (or no file at all) yields a runnable configuration. Durations are
//! written in humantime form (`"24h"`, `"300s"`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::billing::RetryPolicy;
use crate::lifecycle::LifecyclePolicy;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file was not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-level settings.
    pub daemon: DaemonConfig,
    /// Lifecycle windows and activation policy.
    pub lifecycle: LifecyclePolicy,
    /// Payment retry policy.
    pub billing: RetryPolicy,
    /// Sweep scheduling.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on invalid input.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Path to the `SQLite` database.
    pub db_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: PathBuf::from("coop.db"),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    ([127, 0, 0, 1], 8787).into()
}

/// Sweep scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between lifecycle sweeps (expiry, suspension, reminders,
    /// renewals).
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Interval between failed-payment replay sweeps.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// A sweep running longer than this is logged as slow.
    #[serde(with = "humantime_serde")]
    pub soft_timeout: Duration,

    /// A sweep running longer than this is abandoned.
    #[serde(with = "humantime_serde")]
    pub hard_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            retry_interval: Duration::from_secs(60 * 60),
            soft_timeout: Duration::from_secs(25 * 60),
            hard_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ActivationPolicy;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.daemon.listen_addr, default_listen_addr());
        assert_eq!(config.daemon.db_path, PathBuf::from("coop.db"));
        assert_eq!(config.lifecycle.period_days, 30);
        assert_eq!(config.lifecycle.renewal_window_days, 3);
        assert_eq!(config.lifecycle.payment_grace_days, 7);
        assert_eq!(config.lifecycle.activation, ActivationPolicy::Immediate);
        assert_eq!(config.billing.max_attempts, 3);
        assert_eq!(config.scheduler.sweep_interval, Duration::from_secs(86_400));
        assert_eq!(config.scheduler.retry_interval, Duration::from_secs(3_600));
    }

    #[test]
    fn partial_config_overrides_selected_fields() {
        let config = Config::from_toml(
            r#"
            [daemon]
            listen_addr = "0.0.0.0:9000"
            db_path = "/var/lib/coop/coop.db"

            [lifecycle]
            activation = "payment_gated"
            payment_grace_days = 10

            [billing]
            max_attempts = 5
            base_delay = "2m"

            [scheduler]
            sweep_interval = "6h"
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.lifecycle.activation, ActivationPolicy::PaymentGated);
        assert_eq!(config.lifecycle.payment_grace_days, 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.lifecycle.period_days, 30);
        assert_eq!(config.billing.max_attempts, 5);
        assert_eq!(config.billing.base_delay, Duration::from_secs(120));
        assert_eq!(config.scheduler.sweep_interval, Duration::from_secs(21_600));
        assert_eq!(config.scheduler.retry_interval, Duration::from_secs(3_600));
    }

    #[test]
    fn unknown_activation_policy_is_rejected() {
        let err = Config::from_toml("[lifecycle]\nactivation = \"manual\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
