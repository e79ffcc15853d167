//! Therapy data shared by the dosing engine and the command queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Minutes in a day; basal segments start within `0..MINUTES_PER_DAY`.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// One entry of a basal schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalSegment {
    /// Start of the segment in minutes after midnight
    pub start_minute: u32,
    /// Basal rate in U/h
    pub rate: f64,
}

/// A named basal profile with the therapy settings the loop needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalProfile {
    pub name: String,
    pub segments: Vec<BasalSegment>,
    /// Insulin sensitivity (mg/dL per U)
    pub isf: f64,
    /// Carb ratio (g per U)
    pub carb_ratio: f64,
    /// Target range in mg/dL
    pub target_low: f64,
    pub target_high: f64,
}

impl BasalProfile {
    /// A single-rate profile.
    pub fn flat(name: impl Into<String>, rate: f64) -> Self {
        Self {
            name: name.into(),
            segments: vec![BasalSegment {
                start_minute: 0,
                rate,
            }],
            isf: 50.0,
            carb_ratio: 10.0,
            target_low: 90.0,
            target_high: 120.0,
        }
    }

    /// Basal rate in effect at `minute` after midnight.
    pub fn rate_at(&self, minute: u32) -> f64 {
        let minute = minute % MINUTES_PER_DAY;
        self.segments
            .iter()
            .take_while(|s| s.start_minute <= minute)
            .last()
            .or_else(|| self.segments.first())
            .map(|s| s.rate)
            .unwrap_or(0.0)
    }

    /// Midpoint of the target range.
    pub fn target(&self) -> f64 {
        (self.target_low + self.target_high) / 2.0
    }

    /// Check the schedule is complete and within `max_basal_rate`.
    pub fn validate(&self, max_basal_rate: f64) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("profile name is empty".to_string()));
        }
        let first = self
            .segments
            .first()
            .ok_or_else(|| Error::Validation("profile has no basal segments".to_string()))?;
        if first.start_minute != 0 {
            return Err(Error::Validation(
                "first basal segment must start at midnight".to_string(),
            ));
        }
        for pair in self.segments.windows(2) {
            if pair[1].start_minute <= pair[0].start_minute {
                return Err(Error::Validation(
                    "basal segments must be in strictly ascending order".to_string(),
                ));
            }
        }
        for segment in &self.segments {
            if segment.start_minute >= MINUTES_PER_DAY {
                return Err(Error::Validation(format!(
                    "basal segment starts after the end of the day ({} min)",
                    segment.start_minute
                )));
            }
            if !segment.rate.is_finite() || segment.rate < 0.0 || segment.rate > max_basal_rate {
                return Err(Error::Validation(format!(
                    "basal rate {} U/h at minute {} is outside 0..={}",
                    segment.rate, segment.start_minute, max_basal_rate
                )));
            }
        }
        if !(self.isf > 0.0) || !(self.carb_ratio > 0.0) {
            return Err(Error::Validation(
                "isf and carb_ratio must be positive".to_string(),
            ));
        }
        if !(self.target_low > 0.0) || self.target_low > self.target_high {
            return Err(Error::Validation(format!(
                "target range {}..{} is not valid",
                self.target_low, self.target_high
            )));
        }
        Ok(())
    }
}

/// Glucose trend as reported by the CGM source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Trend {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    #[default]
    None,
}

impl Trend {
    /// Parse a Nightscout-style direction string ("Flat", "SingleUp", ...).
    pub fn from_direction(direction: &str) -> Self {
        match direction {
            "DoubleUp" => Trend::DoubleUp,
            "SingleUp" => Trend::SingleUp,
            "FortyFiveUp" => Trend::FortyFiveUp,
            "Flat" => Trend::Flat,
            "FortyFiveDown" => Trend::FortyFiveDown,
            "SingleDown" => Trend::SingleDown,
            "DoubleDown" => Trend::DoubleDown,
            _ => Trend::None,
        }
    }

    /// Classify a change in mg/dL per 5 minutes.
    pub fn from_delta(delta_per_5min: f64) -> Self {
        match delta_per_5min {
            d if !d.is_finite() => Trend::None,
            d if d > 15.0 => Trend::DoubleUp,
            d if d > 10.0 => Trend::SingleUp,
            d if d > 5.0 => Trend::FortyFiveUp,
            d if d >= -5.0 => Trend::Flat,
            d if d >= -10.0 => Trend::FortyFiveDown,
            d if d >= -15.0 => Trend::SingleDown,
            _ => Trend::DoubleDown,
        }
    }
}

/// A CGM reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub timestamp: DateTime<Utc>,
    /// Sensor glucose in mg/dL
    pub mg_dl: f64,
    pub trend: Trend,
}
