//! Queue and pump configuration.
//!
//! Defaults live in the constant modules below so every crate agrees on
//! them. A [`QueueConfig`] can be built from those defaults, read from a
//! TOML file and then overridden by `DOSEPILOT_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Queue and executor defaults.
pub mod defaults {
    /// Maximum number of pending commands.
    pub const MAX_QUEUE_SIZE: usize = 64;
    /// Timeout for a single connection attempt.
    pub const CONNECT_TIMEOUT_MS: u64 = 15_000;
    /// Timeout for a non-bolus device operation.
    pub const EXECUTE_TIMEOUT_MS: u64 = 30_000;
    /// Extra execution time granted per unit of bolus insulin.
    pub const BOLUS_TIMEOUT_PER_UNIT_MS: u64 = 15_000;
    /// Timeout for the status read issued during reconciliation.
    pub const STATUS_TIMEOUT_MS: u64 = 20_000;
    /// Number of lifecycle events kept in memory.
    pub const EVENT_BUFFER_SIZE: usize = 256;
}

/// Retry defaults for connection attempts.
pub mod retry {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const INITIAL_DELAY_MS: u64 = 1_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const MAX_DELAY_MS: u64 = 30_000;
}

/// Pump safety limits used by command validation.
pub mod limits {
    /// Largest single bolus (U).
    pub const MAX_BOLUS: f64 = 10.0;
    /// Largest SMB (U).
    pub const MAX_SMB: f64 = 2.0;
    /// Largest carb entry attached to a bolus (g).
    pub const MAX_CARBS: f64 = 300.0;
    /// Highest absolute basal rate (U/h).
    pub const MAX_BASAL_RATE: f64 = 5.0;
    /// Highest relative temp basal (%).
    pub const MAX_TEMP_PERCENT: u32 = 200;
    /// Longest temp basal or extended bolus (min).
    pub const MAX_DURATION_MIN: u32 = 24 * 60;
    /// Durations must be a multiple of this step (min).
    pub const DURATION_STEP_MIN: u32 = 15;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "DOSEPILOT_CONFIG";
    pub const LOG_JSON: &str = "DOSEPILOT_LOG_JSON";
    pub const MAX_QUEUE_SIZE: &str = "DOSEPILOT_MAX_QUEUE_SIZE";
    pub const CONNECT_TIMEOUT_MS: &str = "DOSEPILOT_CONNECT_TIMEOUT_MS";
    pub const EXECUTE_TIMEOUT_MS: &str = "DOSEPILOT_EXECUTE_TIMEOUT_MS";
    pub const RETRY_MAX_ATTEMPTS: &str = "DOSEPILOT_RETRY_MAX_ATTEMPTS";
    pub const RETRY_INITIAL_DELAY_MS: &str = "DOSEPILOT_RETRY_INITIAL_DELAY_MS";
    pub const DISCONNECT_POLICY: &str = "DOSEPILOT_DISCONNECT_POLICY";
}

/// Connection retry policy with bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of connection attempts per command
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Backoff multiplier for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    retry::MAX_ATTEMPTS
}

fn default_initial_delay() -> u64 {
    retry::INITIAL_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    retry::BACKOFF_MULTIPLIER
}

fn default_max_delay() -> u64 {
    retry::MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// When the executor drops the pump connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Disconnect after every command.
    AfterEachCommand,
    /// Stay connected while work is pending, disconnect once the queue drains.
    #[default]
    WhenIdle,
    /// Keep the link open until shutdown.
    Never,
}

impl std::str::FromStr for DisconnectPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "after_each_command" => Ok(Self::AfterEachCommand),
            "when_idle" => Ok(Self::WhenIdle),
            "never" => Ok(Self::Never),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown disconnect policy '{}'",
                other
            ))),
        }
    }
}

/// Pump limits enforced on every command payload before it is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpLimits {
    #[serde(default = "default_max_bolus")]
    pub max_bolus: f64,
    #[serde(default = "default_max_smb")]
    pub max_smb: f64,
    #[serde(default = "default_max_carbs")]
    pub max_carbs: f64,
    #[serde(default = "default_max_basal_rate")]
    pub max_basal_rate: f64,
    #[serde(default = "default_max_temp_percent")]
    pub max_temp_percent: u32,
    #[serde(default = "default_max_duration")]
    pub max_duration_min: u32,
    #[serde(default = "default_duration_step")]
    pub duration_step_min: u32,
}

fn default_max_bolus() -> f64 {
    limits::MAX_BOLUS
}

fn default_max_smb() -> f64 {
    limits::MAX_SMB
}

fn default_max_carbs() -> f64 {
    limits::MAX_CARBS
}

fn default_max_basal_rate() -> f64 {
    limits::MAX_BASAL_RATE
}

fn default_max_temp_percent() -> u32 {
    limits::MAX_TEMP_PERCENT
}

fn default_max_duration() -> u32 {
    limits::MAX_DURATION_MIN
}

fn default_duration_step() -> u32 {
    limits::DURATION_STEP_MIN
}

impl Default for PumpLimits {
    fn default() -> Self {
        Self {
            max_bolus: default_max_bolus(),
            max_smb: default_max_smb(),
            max_carbs: default_max_carbs(),
            max_basal_rate: default_max_basal_rate(),
            max_temp_percent: default_max_temp_percent(),
            max_duration_min: default_max_duration(),
            duration_step_min: default_duration_step(),
        }
    }
}

/// Configuration for the pump command queue and its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_ms: u64,
    #[serde(default = "default_bolus_timeout_per_unit")]
    pub bolus_timeout_per_unit_ms: u64,
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,
    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limits: PumpLimits,
}

fn default_max_queue_size() -> usize {
    defaults::MAX_QUEUE_SIZE
}

fn default_connect_timeout() -> u64 {
    defaults::CONNECT_TIMEOUT_MS
}

fn default_execute_timeout() -> u64 {
    defaults::EXECUTE_TIMEOUT_MS
}

fn default_bolus_timeout_per_unit() -> u64 {
    defaults::BOLUS_TIMEOUT_PER_UNIT_MS
}

fn default_status_timeout() -> u64 {
    defaults::STATUS_TIMEOUT_MS
}

fn default_event_buffer() -> usize {
    defaults::EVENT_BUFFER_SIZE
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            connect_timeout_ms: default_connect_timeout(),
            execute_timeout_ms: default_execute_timeout(),
            bolus_timeout_per_unit_ms: default_bolus_timeout_per_unit(),
            status_timeout_ms: default_status_timeout(),
            event_buffer_size: default_event_buffer(),
            disconnect_policy: DisconnectPolicy::default(),
            retry: RetryPolicy::default(),
            limits: PumpLimits::default(),
        }
    }
}

impl QueueConfig {
    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded queue configuration");
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `DOSEPILOT_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var(&lookup, env_vars::MAX_QUEUE_SIZE)? {
            self.max_queue_size = value;
        }
        if let Some(value) = parse_var(&lookup, env_vars::CONNECT_TIMEOUT_MS)? {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, env_vars::EXECUTE_TIMEOUT_MS)? {
            self.execute_timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, env_vars::RETRY_MAX_ATTEMPTS)? {
            self.retry.max_attempts = value;
        }
        if let Some(value) = parse_var(&lookup, env_vars::RETRY_INITIAL_DELAY_MS)? {
            self.retry.initial_delay_ms = value;
        }
        if let Some(value) = parse_var(&lookup, env_vars::DISCONNECT_POLICY)? {
            self.disconnect_policy = value;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::InvalidConfiguration(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.execute_timeout_ms == 0 || self.status_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidConfiguration(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        let l = &self.limits;
        for (name, value) in [
            ("limits.max_bolus", l.max_bolus),
            ("limits.max_smb", l.max_smb),
            ("limits.max_carbs", l.max_carbs),
            ("limits.max_basal_rate", l.max_basal_rate),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::InvalidConfiguration(format!(
                    "{} must be a positive number",
                    name
                )));
            }
        }
        if l.max_smb > l.max_bolus {
            return Err(Error::InvalidConfiguration(
                "limits.max_smb cannot exceed limits.max_bolus".to_string(),
            ));
        }
        if l.duration_step_min == 0 || l.max_duration_min < l.duration_step_min {
            return Err(Error::InvalidConfiguration(
                "limits.duration_step_min must be between 1 and limits.max_duration_min".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Execution timeout for a bolus of `units`.
    pub fn bolus_timeout(&self, units: f64) -> Duration {
        let extra = (units.max(0.0) * self.bolus_timeout_per_unit_ms as f64).ceil() as u64;
        Duration::from_millis(self.execute_timeout_ms.saturating_add(extra))
    }

    /// Serialize to TOML, e.g. for `dosepilot config`.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Other(e.into()))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidConfiguration(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}
