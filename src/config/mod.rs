//! Meter configuration using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `INFS_`
//! 2. TOML configuration file
//!
//! # Example
//!
//! ```toml
//! channel = "/dev/ttyS0"
//! address = "01"
//! measures = ["UnfilteredValue", "FilteredValue"]
//!
//! [timing]
//! min_read_spacing_ms = 500
//! answer_retries = 5
//!
//! [serial]
//! baud_rate = 19200
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Nested keys are overridden with a double underscore, e.g.
//! `INFS_TIMING__RECONNECT_DELAY_MS=1000` or `INFS_LOGGING__LEVEL=debug`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::protocol::Command;

/// Lower bound for the answer sleep; the meter cannot answer faster.
pub const MIN_ANSWER_SLEEP_MS: u64 = 50;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level meter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Local serial path (`/dev/ttyS0`) or remote proxy device name
    pub channel: String,
    /// Bus address of the instrument, empty on point-to-point lines
    #[serde(default)]
    pub address: String,
    /// Request/response timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Framing of the direct serial line
    #[serde(default)]
    pub serial: SerialSettings,
    /// Measurements exposed by the device server
    #[serde(default)]
    pub measures: Vec<Command>,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timing constants, tunable per instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum time between two requests on the line
    #[serde(default = "default_min_read_spacing")]
    pub min_read_spacing_ms: u64,
    /// Base sleep before each read attempt
    #[serde(default = "default_answer_sleep")]
    pub answer_sleep_ms: u64,
    /// Read attempts before giving up on an answer
    #[serde(default = "default_answer_retries")]
    pub answer_retries: u32,
    /// Consecutive failed readings before a reconnect is attempted
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u32,
    /// Consecutive failed reconnections before giving up
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
    /// Pause between closing and reopening the transport
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Maximum concurrent subscriptions
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,
}

/// Serial framing for the direct tty transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// 7 or 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity mode
    #[serde(default)]
    pub parity: SerialParity,
    /// 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// XON/XOFF flow control
    #[serde(default = "default_enabled")]
    pub software_flow_control: bool,
    /// Read timeout of one poll of the line
    #[serde(default = "default_io_timeout")]
    pub read_timeout_ms: u64,
    /// Write timeout; serialport has a single timeout for both directions,
    /// so the port uses the larger of the two
    #[serde(default = "default_io_timeout")]
    pub write_timeout_ms: u64,
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    None,
    /// Even parity
    Even,
    /// Odd parity
    #[default]
    Odd,
}

impl SerialParity {
    /// Single letter used in port descriptions.
    pub fn letter(self) -> char {
        match self {
            SerialParity::None => 'N',
            SerialParity::Even => 'E',
            SerialParity::Odd => 'O',
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_min_read_spacing() -> u64 {
    500
}

fn default_answer_sleep() -> u64 {
    MIN_ANSWER_SLEEP_MS
}

fn default_answer_retries() -> u32 {
    5
}

fn default_reconnect_threshold() -> u32 {
    2
}

fn default_reconnect_limit() -> u32 {
    1
}

fn default_reconnect_delay() -> u64 {
    500
}

fn default_max_subscribers() -> usize {
    10
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_data_bits() -> u8 {
    7
}

fn default_stop_bits() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_io_timeout() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_read_spacing_ms: default_min_read_spacing(),
            answer_sleep_ms: default_answer_sleep(),
            answer_retries: default_answer_retries(),
            reconnect_threshold: default_reconnect_threshold(),
            reconnect_limit: default_reconnect_limit(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_subscribers: default_max_subscribers(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: SerialParity::default(),
            stop_bits: default_stop_bits(),
            software_flow_control: default_enabled(),
            read_timeout_ms: default_io_timeout(),
            write_timeout_ms: default_io_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TimingConfig {
    /// Minimum time between two requests.
    pub fn min_read_spacing(&self) -> Duration {
        Duration::from_millis(self.min_read_spacing_ms)
    }

    /// Base answer sleep, never below [`MIN_ANSWER_SLEEP_MS`].
    pub fn answer_sleep(&self) -> Duration {
        Duration::from_millis(self.answer_sleep_ms.max(MIN_ANSWER_SLEEP_MS))
    }

    /// Sleep before read attempt `attempt` (0-based): base plus 10% per attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.answer_sleep();
        base + base.mul_f64(0.1 * f64::from(attempt))
    }

    /// Pause between closing and reopening the line.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SerialSettings {
    /// Port timeout covering both directions.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(self.write_timeout_ms))
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MeterConfig {
    /// Defaults for a given channel and bus address.
    pub fn for_channel(channel: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            address: address.into(),
            timing: TimingConfig::default(),
            serial: SerialSettings::default(),
            measures: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file with `INFS_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("INFS_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Self = figment.extract()?;
        config.validate()?;
        config.clamp_timing();
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "'channel' cannot be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.timing.answer_retries == 0 {
            return Err(ConfigError::ValidationError(
                "'answer_retries' must be > 0".to_string(),
            ));
        }

        if self.timing.max_subscribers == 0 {
            return Err(ConfigError::ValidationError(
                "'max_subscribers' must be > 0".to_string(),
            ));
        }

        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid data_bits {}. Must be 5-8",
                self.serial.data_bits
            )));
        }

        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stop_bits {}. Must be 1 or 2",
                self.serial.stop_bits
            )));
        }

        Ok(())
    }

    /// Raise the answer sleep to the instrument floor.
    pub fn clamp_timing(&mut self) {
        if self.timing.answer_sleep_ms < MIN_ANSWER_SLEEP_MS {
            warn!(
                requested_ms = self.timing.answer_sleep_ms,
                floor_ms = MIN_ANSWER_SLEEP_MS,
                "Answer sleep below instrument minimum, clamping"
            );
            self.timing.answer_sleep_ms = MIN_ANSWER_SLEEP_MS;
        }
    }
}
