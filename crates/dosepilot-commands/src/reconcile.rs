//! Post-failure reconciliation.
//!
//! When the link fails while a dose-affecting command is executing, the
//! executor reads the pump status and asks [`reconcile`] what the read
//! proves. The answer is never a guess: if the snapshot cannot show the
//! command took effect or did not, the result is `DeliveryUnverified`.

use chrono::{DateTime, Utc};

use crate::command::PumpCommand;
use crate::driver::{ActiveTempBasal, DeviceResponse, DriverError, Observed, PumpSnapshot};
use crate::error::CommandError;
use crate::result::PumpEnactResult;

/// Tolerance when comparing insulin amounts and rates.
const AMOUNT_EPSILON: f64 = 0.01;

/// What a status read says about one command.
#[derive(Debug, Clone, PartialEq)]
enum Evidence {
    /// The pump is in the state the command asked for.
    Applied(PumpEnactResult),
    /// The pump is demonstrably not in that state.
    NotApplied,
    Inconclusive,
}

impl Evidence {
    fn map<F: FnOnce(PumpEnactResult) -> PumpEnactResult>(self, f: F) -> Evidence {
        match self {
            Evidence::Applied(result) => Evidence::Applied(f(result)),
            other => other,
        }
    }
}

/// Decide the outcome of `command` after `failure`, using the status read
/// taken afterwards (`None` if that read failed too).
pub fn reconcile(
    command: &PumpCommand,
    dispatched_at: DateTime<Utc>,
    failure: &DriverError,
    snapshot: Option<&PumpSnapshot>,
) -> PumpEnactResult {
    let evidence = match snapshot {
        Some(snapshot) => examine(command, dispatched_at, snapshot),
        None => Evidence::Inconclusive,
    };

    match evidence {
        Evidence::Applied(result) => result,
        Evidence::NotApplied => PumpEnactResult::failed(failure.clone().into()),
        Evidence::Inconclusive => {
            if !failure.is_ambiguous() || !command.kind().is_dose_affecting() {
                PumpEnactResult::failed(failure.clone().into())
            } else {
                let detail = match snapshot {
                    Some(_) => format!(
                        "{} failed ({}) and the pump status does not show whether it was applied",
                        command.describe(),
                        failure
                    ),
                    None => format!(
                        "{} failed ({}) and the pump status could not be read",
                        command.describe(),
                        failure
                    ),
                };
                PumpEnactResult::failed(CommandError::DeliveryUnverified { detail })
            }
        }
    }
}

fn verified(comment: impl Into<String>, enacted: bool) -> PumpEnactResult {
    let mut result = PumpEnactResult::from_response(&DeviceResponse::ok(comment));
    result.enacted = enacted;
    result
}

/// A running temp basal with the requested rate counts only if it was
/// started by this command: after dispatch and with the requested duration.
/// An older matching temp proves nothing, unless the command demanded a
/// fresh one, in which case it was not applied.
fn examine_temp(
    temp: &ActiveTempBasal,
    duration_min: u32,
    enforce_new: bool,
    dispatched_at: DateTime<Utc>,
) -> Evidence {
    if temp.started_at < dispatched_at {
        return if enforce_new {
            Evidence::NotApplied
        } else {
            Evidence::Inconclusive
        };
    }
    if temp.duration_min != duration_min {
        return Evidence::Inconclusive;
    }
    let mut result = verified("", true);
    result.duration_min = Some(temp.duration_min);
    Evidence::Applied(result)
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < AMOUNT_EPSILON
}

fn examine(command: &PumpCommand, dispatched_at: DateTime<Utc>, snapshot: &PumpSnapshot) -> Evidence {
    match command {
        PumpCommand::Bolus(bolus) | PumpCommand::SmbBolus(bolus) => match &snapshot.last_bolus {
            Observed::Present(record) if record.at >= dispatched_at => {
                if record.amount + AMOUNT_EPSILON >= bolus.insulin {
                    let mut result = verified(
                        format!("bolus of {:.2}U confirmed from pump history", record.amount),
                        true,
                    );
                    result.bolus_delivered = record.amount;
                    Evidence::Applied(result)
                } else {
                    let message = format!(
                        "partial bolus: {:.2}U of {:.2}U delivered",
                        record.amount, bolus.insulin
                    );
                    let mut result =
                        PumpEnactResult::failed(CommandError::ExecutionFailed { message });
                    result.enacted = true;
                    result.bolus_delivered = record.amount;
                    Evidence::Applied(result)
                }
            }
            // History without a newer entry may simply not be written yet.
            _ => Evidence::Inconclusive,
        },
        PumpCommand::TempBasalAbsolute {
            rate,
            duration_min,
            enforce_new,
        } => match &snapshot.temp_basal {
            Observed::Present(temp) if temp.absolute_rate.is_some_and(|r| close(r, *rate)) => {
                examine_temp(temp, *duration_min, *enforce_new, dispatched_at).map(|mut result| {
                    result.comment = format!("temp basal {:.2}U/h confirmed from pump status", rate);
                    result.absolute_rate = Some(*rate);
                    result
                })
            }
            Observed::Present(_) | Observed::Absent => Evidence::NotApplied,
            Observed::Unknown => Evidence::Inconclusive,
        },
        PumpCommand::TempBasalPercent {
            percent,
            duration_min,
            enforce_new,
        } => match &snapshot.temp_basal {
            Observed::Present(temp) if temp.percent == Some(*percent) => {
                examine_temp(temp, *duration_min, *enforce_new, dispatched_at).map(|mut result| {
                    result.comment = format!("temp basal {}% confirmed from pump status", percent);
                    result.percent = Some(*percent);
                    result
                })
            }
            Observed::Present(_) | Observed::Absent => Evidence::NotApplied,
            Observed::Unknown => Evidence::Inconclusive,
        },
        PumpCommand::CancelTempBasal { .. } => match &snapshot.temp_basal {
            Observed::Absent => {
                let mut result = verified("no temp basal running", true);
                result.is_temp_cancel = true;
                Evidence::Applied(result)
            }
            Observed::Present(_) => Evidence::NotApplied,
            Observed::Unknown => Evidence::Inconclusive,
        },
        PumpCommand::ExtendedBolus { insulin, .. } => match &snapshot.extended_bolus {
            Observed::Present(ext) if close(ext.insulin, *insulin) => {
                if ext.started_at >= dispatched_at {
                    let mut result = verified(
                        format!("extended bolus {:.2}U confirmed from pump status", insulin),
                        true,
                    );
                    result.duration_min = Some(ext.duration_min);
                    Evidence::Applied(result)
                } else {
                    // Same amount, but started before this command was sent
                    Evidence::Inconclusive
                }
            }
            Observed::Present(_) | Observed::Absent => Evidence::NotApplied,
            Observed::Unknown => Evidence::Inconclusive,
        },
        PumpCommand::CancelExtendedBolus => match &snapshot.extended_bolus {
            Observed::Absent => Evidence::Applied(verified("no extended bolus running", true)),
            Observed::Present(_) => Evidence::NotApplied,
            Observed::Unknown => Evidence::Inconclusive,
        },
        PumpCommand::SetProfile(profile) => match &snapshot.profile_name {
            Some(name) if *name == profile.name => Evidence::Applied(verified(
                format!("profile {} active on pump", name),
                true,
            )),
            Some(_) => Evidence::NotApplied,
            None => Evidence::Inconclusive,
        },
        PumpCommand::StopPump => {
            if snapshot.suspended {
                Evidence::Applied(verified("pump suspended", true))
            } else {
                Evidence::NotApplied
            }
        }
        PumpCommand::StartPump => {
            if snapshot.suspended {
                Evidence::NotApplied
            } else {
                Evidence::Applied(verified("pump running", true))
            }
        }
        PumpCommand::ReadStatus { .. }
        | PumpCommand::LoadHistory { .. }
        | PumpCommand::LoadEvents
        | PumpCommand::LoadTdds
        | PumpCommand::SetUserSettings { .. }
        | PumpCommand::VendorSpecificNotification { .. } => Evidence::Inconclusive,
    }
}
