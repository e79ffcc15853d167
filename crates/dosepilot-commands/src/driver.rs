//! Device driver seam.
//!
//! The queue never talks to a radio itself. A [`PumpDriver`] owns the
//! transport and the vendor protocol and executes exactly one command per
//! call. Drivers report what the pump said; interpreting failures is the
//! executor's job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::PumpCommand;
use crate::error::CommandError;

/// Driver error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Pump is reachable but occupied with something else.
    #[error("Pump busy: {0}")]
    Busy(String),

    #[error("Timeout waiting for response (partial: {partial})")]
    Timeout { partial: bool },

    /// Link dropped after the command was sent.
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// Pump answered and refused the command.
    #[error("Rejected by pump: {0}")]
    Rejected(String),

    #[error("Driver not connected")]
    NotConnected,

    #[error("Other error: {0}")]
    Other(String),
}

impl DriverError {
    /// Part of a response arrived, so the pump saw the command.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { partial: true } | DriverError::LinkLost(_)
        )
    }

    /// The error says nothing certain about whether the pump acted.
    pub fn is_ambiguous(&self) -> bool {
        !matches!(
            self,
            DriverError::Rejected(_) | DriverError::Busy(_) | DriverError::NotConnected
        )
    }
}

impl From<DriverError> for CommandError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Timeout { partial } => CommandError::Timeout { partial },
            DriverError::ConnectionFailed(message) => CommandError::ConnectionFailed {
                attempts: 1,
                message,
            },
            DriverError::NotConnected => CommandError::ConnectionFailed {
                attempts: 1,
                message: "driver not connected".to_string(),
            },
            other => CommandError::ExecutionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// A field the pump may or may not have reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Observed<T> {
    /// Not part of the read, or the read failed.
    #[default]
    Unknown,
    /// Reported as not running / not present.
    Absent,
    Present(T),
}

impl<T> Observed<T> {
    pub fn is_known(&self) -> bool {
        !matches!(self, Observed::Unknown)
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Observed::Present(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTempBasal {
    pub absolute_rate: Option<f64>,
    pub percent: Option<u32>,
    pub duration_min: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveExtendedBolus {
    pub insulin: f64,
    pub duration_min: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BolusRecord {
    pub amount: f64,
    pub at: DateTime<Utc>,
}

/// Pump state as read by a status command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSnapshot {
    pub read_at: DateTime<Utc>,
    pub suspended: bool,
    pub reservoir_units: Option<f64>,
    pub battery_percent: Option<u8>,
    pub base_basal_rate: Option<f64>,
    #[serde(default)]
    pub temp_basal: Observed<ActiveTempBasal>,
    #[serde(default)]
    pub extended_bolus: Observed<ActiveExtendedBolus>,
    /// Most recent bolus in pump history
    #[serde(default)]
    pub last_bolus: Observed<BolusRecord>,
    pub profile_name: Option<String>,
}

impl PumpSnapshot {
    /// A snapshot that knows nothing but the read time.
    pub fn unknown() -> Self {
        Self {
            read_at: Utc::now(),
            suspended: false,
            reservoir_units: None,
            battery_percent: None,
            base_basal_rate: None,
            temp_basal: Observed::Unknown,
            extended_bolus: Observed::Unknown,
            last_bolus: Observed::Unknown,
            profile_name: None,
        }
    }
}

/// What the pump answered to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub enacted: bool,
    pub comment: String,
    pub bolus_delivered: f64,
    pub absolute_rate: Option<f64>,
    pub percent: Option<u32>,
    pub duration_min: Option<u32>,
    pub is_temp_cancel: bool,
    /// Pump state, when the command was a read or the driver refreshed it
    pub snapshot: Option<PumpSnapshot>,
}

impl DeviceResponse {
    /// Successful response that changed nothing.
    pub fn ok(comment: impl Into<String>) -> Self {
        Self {
            enacted: false,
            comment: comment.into(),
            bolus_delivered: 0.0,
            absolute_rate: None,
            percent: None,
            duration_min: None,
            is_temp_cancel: false,
            snapshot: None,
        }
    }

    /// Successful response that changed the pump state.
    pub fn enacted(comment: impl Into<String>) -> Self {
        Self {
            enacted: true,
            ..Self::ok(comment)
        }
    }

    pub fn with_snapshot(mut self, snapshot: PumpSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Pump device driver.
///
/// Called only from the executor task, one call at a time.
#[async_trait]
pub trait PumpDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &str;

    /// Establish the link. Must give up after `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Execute one command on a connected pump.
    async fn execute(&self, command: &PumpCommand) -> Result<DeviceResponse, DriverError>;

    /// Drop the link. Never fails; an already closed link is fine.
    async fn disconnect(&self);
}
