//! Interface to the dosing engine.
//!
//! The engine decides *what* the pump should do; the command queue decides
//! *how and when* it reaches the pump. Engines are stateless from the
//! queue's point of view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::therapy::{BasalProfile, GlucoseReading};

/// Requested change to basal delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BasalAction {
    /// Leave whatever is running untouched.
    #[default]
    Keep,
    /// Run a temporary absolute rate.
    SetTemp { rate: f64, duration_min: u32 },
    /// Return to the scheduled basal.
    Cancel,
}

/// Output of one dosing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingRecommendation {
    pub basal: BasalAction,
    /// Super micro bolus in U, if any
    pub smb_units: Option<f64>,
    /// Human-readable explanation from the engine
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

impl DosingRecommendation {
    /// A recommendation that changes nothing.
    pub fn keep(reason: impl Into<String>) -> Self {
        Self {
            basal: BasalAction::Keep,
            smb_units: None,
            reason: reason.into(),
            computed_at: Utc::now(),
        }
    }

    pub fn with_basal(mut self, basal: BasalAction) -> Self {
        self.basal = basal;
        self
    }

    pub fn with_smb(mut self, units: f64) -> Self {
        self.smb_units = Some(units);
        self
    }

    /// True if acting on this recommendation would enqueue nothing.
    pub fn is_noop(&self) -> bool {
        self.basal == BasalAction::Keep && self.smb_units.map_or(true, |u| u <= 0.0)
    }
}

/// A dosing algorithm.
pub trait DosingEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Compute a recommendation from recent glucose, insulin on board (U),
    /// carbs on board (g) and the active profile.
    fn compute_dosing(
        &self,
        glucose_history: &[GlucoseReading],
        iob: f64,
        cob: f64,
        profile: &BasalProfile,
    ) -> DosingRecommendation;
}
