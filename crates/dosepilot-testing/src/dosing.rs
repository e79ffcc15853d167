//! Reference dosing engine for simulations.
//!
//! Deliberately simple: predicts glucose 30 minutes ahead from the last
//! delta and insulin/carbs on board, then steers toward the profile
//! target. It exists to exercise the command queue, not to dose anyone.

use chrono::Timelike;

use dosepilot_core::dosing::{BasalAction, DosingEngine, DosingRecommendation};
use dosepilot_core::therapy::{BasalProfile, GlucoseReading};

/// Readings ahead used for the prediction (5 min each).
const HORIZON_READINGS: f64 = 6.0;

/// Below this glucose (mg/dL) basal is suspended regardless of prediction.
const LOW_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone)]
pub struct TargetDosingEngine {
    pub max_smb: f64,
    pub max_basal_rate: f64,
    pub temp_duration_min: u32,
    /// Share of the insulin requirement given as SMB
    pub smb_fraction: f64,
}

impl Default for TargetDosingEngine {
    fn default() -> Self {
        Self {
            max_smb: 1.0,
            max_basal_rate: 3.0,
            temp_duration_min: 30,
            smb_fraction: 0.5,
        }
    }
}

fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

impl DosingEngine for TargetDosingEngine {
    fn name(&self) -> &str {
        "target"
    }

    fn compute_dosing(
        &self,
        glucose_history: &[GlucoseReading],
        iob: f64,
        cob: f64,
        profile: &BasalProfile,
    ) -> DosingRecommendation {
        let Some(last) = glucose_history.last() else {
            return DosingRecommendation::keep("no glucose data");
        };

        let delta = glucose_history
            .len()
            .checked_sub(2)
            .and_then(|i| glucose_history.get(i))
            .map(|prev| last.mg_dl - prev.mg_dl)
            .unwrap_or(0.0);

        let carb_effect = cob / profile.carb_ratio * profile.isf;
        let eventual = last.mg_dl + delta * HORIZON_READINGS - iob * profile.isf + carb_effect;
        let minute = last.timestamp.hour() * 60 + last.timestamp.minute();
        let scheduled = profile.rate_at(minute);

        if last.mg_dl < LOW_THRESHOLD || eventual < profile.target_low - 20.0 {
            return DosingRecommendation::keep(format!(
                "low predicted: bg {:.0}, eventual {:.0}",
                last.mg_dl, eventual
            ))
            .with_basal(BasalAction::SetTemp {
                rate: 0.0,
                duration_min: self.temp_duration_min,
            });
        }

        if eventual <= profile.target_high {
            return DosingRecommendation::keep(format!(
                "in range: bg {:.0}, eventual {:.0}",
                last.mg_dl, eventual
            ));
        }

        let insulin_req = (eventual - profile.target()) / profile.isf - iob;
        if insulin_req <= 0.0 {
            return DosingRecommendation::keep(format!(
                "high but covered by IOB {:.2}U",
                iob
            ));
        }

        let rate = round_to((scheduled + insulin_req).min(self.max_basal_rate), 0.05);
        let mut recommendation = DosingRecommendation::keep(format!(
            "high: bg {:.0}, eventual {:.0}, insulin required {:.2}U",
            last.mg_dl, eventual, insulin_req
        ))
        .with_basal(BasalAction::SetTemp {
            rate,
            duration_min: self.temp_duration_min,
        });

        let smb = round_to((insulin_req * self.smb_fraction).min(self.max_smb), 0.05);
        if smb >= 0.05 {
            recommendation = recommendation.with_smb(smb);
        }
        recommendation
    }
}
