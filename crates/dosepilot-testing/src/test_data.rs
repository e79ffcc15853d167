//! Glucose trace generation
//!
//! Reproducible CGM traces for driving a dosing engine in tests and in the
//! closed-loop simulation.

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use dosepilot_core::therapy::{GlucoseReading, Trend};

/// Lowest and highest values a CGM reports (mg/dL).
pub const CGM_MIN: f64 = 39.0;
pub const CGM_MAX: f64 = 401.0;

/// Minutes between CGM readings.
pub const READING_INTERVAL_MIN: i64 = 5;

/// Shape of a generated trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataPattern {
    /// Flat line
    Constant { base: f64 },
    /// Straight line, `slope` mg/dL per reading
    Linear { start: f64, slope: f64 },
    /// Slow oscillation
    SineWave {
        offset: f64,
        amplitude: f64,
        period_points: usize,
    },
    /// Linear drift with uniform noise
    TrendWithNoise { base: f64, trend: f64, noise: f64 },
    /// Post-meal rise and fall peaking at `at_point`
    MealSpike {
        base: f64,
        peak: f64,
        at_point: usize,
        width_points: usize,
    },
}

/// Canned traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlucoseScenario {
    InRange,
    RisingAfterMeal,
    FallingToLow,
    Overnight,
}

/// Generator for glucose traces
pub struct TestDataGenerator {
    seed: u64,
}

impl TestDataGenerator {
    /// Create a generator with a specific seed (for reproducible tests)
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// `points` readings ending now, five minutes apart.
    pub fn glucose_trace(&self, pattern: &DataPattern, points: usize) -> Vec<GlucoseReading> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let now = Utc::now();
        let mut readings: Vec<GlucoseReading> = Vec::with_capacity(points);

        for i in 0..points {
            let value = match pattern {
                DataPattern::Constant { base } => *base,
                DataPattern::Linear { start, slope } => start + slope * i as f64,
                DataPattern::SineWave {
                    offset,
                    amplitude,
                    period_points,
                } => {
                    let period = (*period_points).max(1) as f64;
                    offset + amplitude * (i as f64 * 2.0 * std::f64::consts::PI / period).sin()
                }
                DataPattern::TrendWithNoise { base, trend, noise } => {
                    let jitter = if *noise > 0.0 {
                        rng.gen_range(-*noise..=*noise)
                    } else {
                        0.0
                    };
                    base + trend * i as f64 + jitter
                }
                DataPattern::MealSpike {
                    base,
                    peak,
                    at_point,
                    width_points,
                } => {
                    let width = (*width_points).max(1) as f64;
                    let distance = (i as f64 - *at_point as f64) / width;
                    base + (peak - base) * (-distance * distance).exp()
                }
            };

            let mg_dl = value.clamp(CGM_MIN, CGM_MAX).round();
            let trend = readings
                .last()
                .map(|prev| Trend::from_delta(mg_dl - prev.mg_dl))
                .unwrap_or(Trend::Flat);
            let minutes_ago = (points - 1 - i) as i64 * READING_INTERVAL_MIN;

            readings.push(GlucoseReading {
                timestamp: now - Duration::minutes(minutes_ago),
                mg_dl,
                trend,
            });
        }

        readings
    }

    /// Two hours of readings for a canned scenario.
    pub fn scenario(&self, scenario: GlucoseScenario) -> Vec<GlucoseReading> {
        let pattern = match scenario {
            GlucoseScenario::InRange => DataPattern::TrendWithNoise {
                base: 110.0,
                trend: 0.0,
                noise: 0.5,
            },
            GlucoseScenario::RisingAfterMeal => DataPattern::MealSpike {
                base: 120.0,
                peak: 240.0,
                at_point: 30,
                width_points: 10,
            },
            GlucoseScenario::FallingToLow => DataPattern::Linear {
                start: 140.0,
                slope: -3.5,
            },
            GlucoseScenario::Overnight => DataPattern::SineWave {
                offset: 120.0,
                amplitude: 25.0,
                period_points: 48,
            },
        };
        self.glucose_trace(&pattern, 24)
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::with_seed(rand::random())
    }
}
