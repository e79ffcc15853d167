//! Outcome of a pump command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::CommandId;
use crate::driver::DeviceResponse;
use crate::error::{CommandError, RejectReason};

/// Result delivered to every caller of a command, exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEnactResult {
    /// The command achieved what was asked
    pub success: bool,
    /// The pump state changed because of this command
    pub enacted: bool,
    /// Human readable summary
    pub comment: String,
    /// Failure classification when `success` is false
    pub error: Option<CommandError>,
    /// Bolus insulin the pump reported as delivered (U)
    pub bolus_delivered: f64,
    /// Temp basal rate now running (U/h)
    pub absolute_rate: Option<f64>,
    /// Relative temp basal now running (%)
    pub percent: Option<u32>,
    pub duration_min: Option<u32>,
    /// A running temp basal was cancelled
    pub is_temp_cancel: bool,
    pub completed_at: DateTime<Utc>,
}

impl PumpEnactResult {
    fn empty(success: bool) -> Self {
        Self {
            success,
            enacted: false,
            comment: String::new(),
            error: None,
            bolus_delivered: 0.0,
            absolute_rate: None,
            percent: None,
            duration_min: None,
            is_temp_cancel: false,
            completed_at: Utc::now(),
        }
    }

    /// Successful execution as reported by the driver.
    pub fn from_response(response: &DeviceResponse) -> Self {
        let mut result = Self::empty(true);
        result.enacted = response.enacted;
        result.comment = response.comment.clone();
        result.bolus_delivered = response.bolus_delivered;
        result.absolute_rate = response.absolute_rate;
        result.percent = response.percent;
        result.duration_min = response.duration_min;
        result.is_temp_cancel = response.is_temp_cancel;
        result
    }

    /// A failure carrying `error`.
    pub fn failed(error: CommandError) -> Self {
        let mut result = Self::empty(false);
        result.comment = error.to_string();
        result.error = Some(error);
        result
    }

    pub fn superseded(by: impl Into<CommandId>) -> Self {
        Self::failed(CommandError::Superseded { by: by.into() })
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::failed(CommandError::Cancelled {
            reason: reason.into(),
        })
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self::failed(reason.into())
    }

    /// Error code, or `"ok"`.
    pub fn code(&self) -> &'static str {
        self.error.as_ref().map_or("ok", CommandError::code)
    }

    /// The caller must verify the pump manually.
    pub fn is_unverified(&self) -> bool {
        matches!(self.error, Some(CommandError::DeliveryUnverified { .. }))
    }
}
