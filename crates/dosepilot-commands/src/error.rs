//! Error taxonomy for pump commands.
//!
//! Every failure a caller can observe is one of these values carried inside
//! a [`PumpEnactResult`](crate::result::PumpEnactResult). Nothing here is
//! ever raised past the dispatcher.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandId;

/// A command payload that failed validation. Never queued.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("{field} must be a finite number")]
    NotFinite { field: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: String },

    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("duration of {minutes} min must be a positive multiple of {step} min up to {max} min")]
    Duration { minutes: u32, step: u32, max: u32 },

    #[error("{field} must not be empty")]
    Empty { field: String },

    #[error("invalid profile: {0}")]
    Profile(String),
}

impl ValidationError {
    pub(crate) fn out_of_range(field: &str, value: f64, min: f64, max: f64) -> Self {
        ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        }
    }
}

/// Why the queue refused to admit a command.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("{0}")]
    Invalid(ValidationError),

    #[error("Queue is full")]
    Full,

    #[error("Queue is closed")]
    Closed,

    #[error("Pump is suspended")]
    PumpSuspended,

    #[error("Another bolus is queued or running")]
    BolusInProgress,
}

/// Failure carried by a resolved command.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum CommandError {
    /// Payload failed validation; the pump was never contacted.
    #[error("invalid command: {0}")]
    Validation(ValidationError),

    /// Displaced by a newer command of the same conflict class.
    #[error("superseded by newer command {by}")]
    Superseded { by: CommandId },

    /// Removed from the queue by a reset or shutdown.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// Refused at admission.
    #[error("rejected: {0}")]
    Rejected(RejectReason),

    /// Pump unreachable within the retry budget.
    #[error("pump unreachable after {attempts} attempt(s): {message}")]
    ConnectionFailed { attempts: u32, message: String },

    /// Pump reachable but refused or failed the operation.
    #[error("pump failed the command: {message}")]
    ExecutionFailed { message: String },

    /// No complete response in time.
    #[error("pump communication timed out (partial response: {partial})")]
    Timeout { partial: bool },

    /// The operation may or may not have taken effect.
    #[error("delivery unverified, check the pump manually: {detail}")]
    DeliveryUnverified { detail: String },
}

impl CommandError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::Superseded { .. } => "superseded",
            CommandError::Cancelled { .. } => "cancelled",
            CommandError::Rejected(_) => "rejected",
            CommandError::ConnectionFailed { .. } => "connection_failed",
            CommandError::ExecutionFailed { .. } => "execution_failed",
            CommandError::Timeout { .. } => "timeout",
            CommandError::DeliveryUnverified { .. } => "delivery_unverified",
        }
    }

    /// Errors that came from talking to the pump, as opposed to queue
    /// bookkeeping.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            CommandError::ConnectionFailed { .. }
                | CommandError::ExecutionFailed { .. }
                | CommandError::Timeout { .. }
                | CommandError::DeliveryUnverified { .. }
        )
    }
}

impl From<RejectReason> for CommandError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::Invalid(err) => CommandError::Validation(err),
            other => CommandError::Rejected(other),
        }
    }
}
