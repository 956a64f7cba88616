//! Configuration management for bustrack.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "bustrack";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `BUSTRACK_`, sections split on `__`)
/// 2. TOML config file at `~/.config/bustrack/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Publisher and consumer timing.
    pub tracking: TrackingConfig,
    /// Shared connection behaviour.
    pub connection: ConnectionConfig,
    /// Route directory access.
    pub directory: DirectoryConfig,
}

/// How consumers order incoming samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Discard samples stamped older than the one displayed.
    #[default]
    Sequenced,
    /// Whatever arrives last is displayed.
    LastWriteWins,
}

/// Tracking-related configuration.
///
/// The defaults are part of the observable contract with other clients:
/// changing them changes how stale a displayed position can get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Interval between consumer position requests in milliseconds.
    pub poll_interval_ms: u64,
    /// Minimum time between device samples in milliseconds.
    pub min_update_interval_ms: u64,
    /// Minimum distance between device samples in metres.
    pub min_update_distance_m: f64,
    /// Ordering applied to inbound samples.
    pub ordering: OrderingPolicy,
    /// Capacity of the device sample queue.
    pub sample_queue: usize,
}

/// Connection-related configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before giving up. 0 retries forever.
    pub max_attempts: u32,
    /// Frames held while the connection is not open.
    pub send_buffer: usize,
    /// Capacity of the inbound response queue per subscriber.
    pub response_queue: usize,
    /// A connection that delivers no frame and closes sooner than this
    /// counts as a failed attempt.
    pub stable_after_ms: u64,
    /// WebSocket URL of an external relay (`ws://host:port/path`).
    pub relay_url: Option<String>,
    /// Handshake timeout for the relay in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Route directory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// JSON fixture with routes and transport records.
    /// Defaults to the built-in demo data.
    pub fixture_path: Option<PathBuf>,
    /// Timeout for one directory lookup in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            min_update_interval_ms: 2_000,
            min_update_distance_m: 10.0,
            ordering: OrderingPolicy::Sequenced,
            sample_queue: 64,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 0, // Retry forever
            send_buffer: 32,
            response_queue: 64,
            stable_after_ms: 10_000,
            relay_url: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            fixture_path: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl TrackingConfig {
    /// Get the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the minimum sample interval as a Duration.
    #[must_use]
    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }
}

impl ConnectionConfig {
    /// Get the initial backoff as a Duration.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get the maximum backoff as a Duration.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Get the relay handshake timeout as a Duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the stable-connection threshold as a Duration.
    #[must_use]
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

impl DirectoryConfig {
    /// Get the lookup timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `BUSTRACK_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("BUSTRACK_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        self.tracking.validate()?;
        self.connection.validate()?;
        self.directory.validate()
    }
}

impl TrackingConfig {
    /// Check the tracking section on its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] for a zero poll or update
    /// interval, a negative distance or an empty sample queue.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be greater than 0"));
        }

        if self.min_update_interval_ms == 0 {
            return Err(invalid("min_update_interval_ms must be greater than 0"));
        }

        let distance = self.min_update_distance_m;
        if distance.is_nan() || distance < 0.0 {
            return Err(invalid(format!(
                "min_update_distance_m ({distance}) must be zero or positive"
            )));
        }

        if self.sample_queue == 0 {
            return Err(invalid("sample_queue must be greater than 0"));
        }

        Ok(())
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(invalid("initial_backoff_ms must be greater than 0"));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(format!(
                "initial_backoff_ms ({}) cannot be greater than max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if self.send_buffer == 0 || self.response_queue == 0 {
            return Err(invalid(
                "send_buffer and response_queue must be greater than 0",
            ));
        }

        if let Some(url) = &self.relay_url {
            if !url.starts_with("ws://") {
                return Err(invalid(format!("relay_url ({url}) must be a ws:// URL")));
            }
        }

        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}

impl DirectoryConfig {
    fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
