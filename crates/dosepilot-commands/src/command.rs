//! Command data structures.
//!
//! A [`PumpCommand`] is a closed set of pump operations. Everything the
//! queue needs to know about a kind (priority, conflict class, whether it
//! changes insulin delivery) is derived here by exhaustive matches, so a
//! new kind cannot be added without deciding each of them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dosepilot_core::config::PumpLimits;
use dosepilot_core::therapy::BasalProfile;

use crate::error::ValidationError;

/// Unique command identifier.
pub type CommandId = String;

/// Command source origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandSource {
    /// Issued by the closed-loop algorithm.
    Loop {
        /// Reason reported by the dosing engine
        reason: String,
    },
    /// Manual user action.
    User {
        /// User ID
        user_id: String,
    },
    /// Automation rule.
    Automation {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
    /// Scheduled polling.
    Schedule {
        /// Schedule ID
        schedule_id: String,
    },
    /// System command.
    System {
        /// Reason
        reason: String,
    },
}

impl CommandSource {
    /// Get a string identifier for the source.
    pub fn id(&self) -> String {
        match self {
            CommandSource::Loop { .. } => "loop".to_string(),
            CommandSource::User { user_id } => format!("user:{}", user_id),
            CommandSource::Automation { rule_id, .. } => format!("automation:{}", rule_id),
            CommandSource::Schedule { schedule_id } => format!("schedule:{}", schedule_id),
            CommandSource::System { .. } => "system".to_string(),
        }
    }

    /// Get the source type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandSource::Loop { .. } => "loop",
            CommandSource::User { .. } => "user",
            CommandSource::Automation { .. } => "automation",
            CommandSource::Schedule { .. } => "schedule",
            CommandSource::System { .. } => "system",
        }
    }

    pub fn system(reason: impl Into<String>) -> Self {
        CommandSource::System {
            reason: reason.into(),
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        CommandSource::User {
            user_id: user_id.into(),
        }
    }
}

/// Command priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    /// History downloads
    Low = 1,
    /// Status reads and settings
    Normal = 2,
    /// Basal changes and profile updates
    High = 3,
    /// Boluses
    Critical = 4,
    /// Anything that stops insulin delivery
    Emergency = 5,
}

impl CommandPriority {
    /// Get the priority value.
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Get priority from integer value.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(CommandPriority::Low),
            2 => Some(CommandPriority::Normal),
            3 => Some(CommandPriority::High),
            4 => Some(CommandPriority::Critical),
            5 => Some(CommandPriority::Emergency),
            _ => None,
        }
    }

    /// Get the priority type name.
    pub fn type_name(&self) -> &str {
        match self {
            CommandPriority::Low => "low",
            CommandPriority::Normal => "normal",
            CommandPriority::High => "high",
            CommandPriority::Critical => "critical",
            CommandPriority::Emergency => "emergency",
        }
    }

    /// All levels from lowest to highest.
    pub const ALL: [CommandPriority; 5] = [
        CommandPriority::Low,
        CommandPriority::Normal,
        CommandPriority::High,
        CommandPriority::Critical,
        CommandPriority::Emergency,
    ];
}

impl std::fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.type_name();
        write!(f, "{}", name)
    }
}

/// Variant tag of a [`PumpCommand`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ReadStatus,
    Bolus,
    SmbBolus,
    ExtendedBolus,
    CancelExtendedBolus,
    TempBasalAbsolute,
    TempBasalPercent,
    CancelTempBasal,
    SetProfile,
    StartPump,
    StopPump,
    LoadHistory,
    LoadEvents,
    LoadTdds,
    SetUserSettings,
    VendorSpecificNotification,
}

/// Group of kinds that may not be pending side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictClass {
    /// Never merged (boluses, start/stop).
    Independent,
    TempBasal,
    ExtendedBolus,
    Status,
    Profile,
    History,
    Events,
    Tdds,
    UserSettings,
    VendorNotification,
}

/// What the queue does when a command meets a pending one of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Both stay queued.
    Keep,
    /// The newer command displaces the pending one.
    Supersede,
    /// The newer request rides on the pending execution.
    Coalesce,
}

impl ConflictClass {
    pub fn merge_rule(self) -> MergeRule {
        match self {
            ConflictClass::Independent => MergeRule::Keep,
            ConflictClass::TempBasal
            | ConflictClass::ExtendedBolus
            | ConflictClass::Profile
            | ConflictClass::UserSettings
            | ConflictClass::VendorNotification => MergeRule::Supersede,
            ConflictClass::Status
            | ConflictClass::History
            | ConflictClass::Events
            | ConflictClass::Tdds => MergeRule::Coalesce,
        }
    }
}

impl CommandKind {
    pub const ALL: [CommandKind; 16] = [
        CommandKind::ReadStatus,
        CommandKind::Bolus,
        CommandKind::SmbBolus,
        CommandKind::ExtendedBolus,
        CommandKind::CancelExtendedBolus,
        CommandKind::TempBasalAbsolute,
        CommandKind::TempBasalPercent,
        CommandKind::CancelTempBasal,
        CommandKind::SetProfile,
        CommandKind::StartPump,
        CommandKind::StopPump,
        CommandKind::LoadHistory,
        CommandKind::LoadEvents,
        CommandKind::LoadTdds,
        CommandKind::SetUserSettings,
        CommandKind::VendorSpecificNotification,
    ];

    pub fn priority(self) -> CommandPriority {
        match self {
            CommandKind::StopPump
            | CommandKind::CancelTempBasal
            | CommandKind::CancelExtendedBolus => CommandPriority::Emergency,
            CommandKind::Bolus | CommandKind::SmbBolus => CommandPriority::Critical,
            CommandKind::TempBasalAbsolute
            | CommandKind::TempBasalPercent
            | CommandKind::ExtendedBolus
            | CommandKind::SetProfile
            | CommandKind::StartPump => CommandPriority::High,
            CommandKind::ReadStatus
            | CommandKind::SetUserSettings
            | CommandKind::VendorSpecificNotification => CommandPriority::Normal,
            CommandKind::LoadHistory | CommandKind::LoadEvents | CommandKind::LoadTdds => {
                CommandPriority::Low
            }
        }
    }

    pub fn conflict_class(self) -> ConflictClass {
        match self {
            CommandKind::Bolus
            | CommandKind::SmbBolus
            | CommandKind::StartPump
            | CommandKind::StopPump => ConflictClass::Independent,
            CommandKind::TempBasalAbsolute
            | CommandKind::TempBasalPercent
            | CommandKind::CancelTempBasal => ConflictClass::TempBasal,
            CommandKind::ExtendedBolus | CommandKind::CancelExtendedBolus => {
                ConflictClass::ExtendedBolus
            }
            CommandKind::ReadStatus => ConflictClass::Status,
            CommandKind::SetProfile => ConflictClass::Profile,
            CommandKind::LoadHistory => ConflictClass::History,
            CommandKind::LoadEvents => ConflictClass::Events,
            CommandKind::LoadTdds => ConflictClass::Tdds,
            CommandKind::SetUserSettings => ConflictClass::UserSettings,
            CommandKind::VendorSpecificNotification => ConflictClass::VendorNotification,
        }
    }

    /// Whether executing this kind can change insulin delivery.
    pub fn is_dose_affecting(self) -> bool {
        match self {
            CommandKind::Bolus
            | CommandKind::SmbBolus
            | CommandKind::ExtendedBolus
            | CommandKind::CancelExtendedBolus
            | CommandKind::TempBasalAbsolute
            | CommandKind::TempBasalPercent
            | CommandKind::CancelTempBasal
            | CommandKind::SetProfile
            | CommandKind::StartPump
            | CommandKind::StopPump => true,
            CommandKind::ReadStatus
            | CommandKind::LoadHistory
            | CommandKind::LoadEvents
            | CommandKind::LoadTdds
            | CommandKind::SetUserSettings
            | CommandKind::VendorSpecificNotification => false,
        }
    }

    pub fn is_bolus(self) -> bool {
        matches!(self, CommandKind::Bolus | CommandKind::SmbBolus)
    }

    /// Kinds refused while the pump is suspended.
    pub fn requires_running_pump(self) -> bool {
        matches!(
            self,
            CommandKind::Bolus | CommandKind::SmbBolus | CommandKind::ExtendedBolus
        )
    }

    pub fn type_name(self) -> &'static str {
        match self {
            CommandKind::ReadStatus => "read_status",
            CommandKind::Bolus => "bolus",
            CommandKind::SmbBolus => "smb_bolus",
            CommandKind::ExtendedBolus => "extended_bolus",
            CommandKind::CancelExtendedBolus => "cancel_extended_bolus",
            CommandKind::TempBasalAbsolute => "temp_basal_absolute",
            CommandKind::TempBasalPercent => "temp_basal_percent",
            CommandKind::CancelTempBasal => "cancel_temp_basal",
            CommandKind::SetProfile => "set_profile",
            CommandKind::StartPump => "start_pump",
            CommandKind::StopPump => "stop_pump",
            CommandKind::LoadHistory => "load_history",
            CommandKind::LoadEvents => "load_events",
            CommandKind::LoadTdds => "load_tdds",
            CommandKind::SetUserSettings => "set_user_settings",
            CommandKind::VendorSpecificNotification => "vendor_specific_notification",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Bolus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BolusRequest {
    /// Insulin in U
    pub insulin: f64,
    /// Carbs covered by this bolus in g
    #[serde(default)]
    pub carbs: f64,
}

impl BolusRequest {
    pub fn insulin(insulin: f64) -> Self {
        Self { insulin, carbs: 0.0 }
    }
}

/// One requested pump operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PumpCommand {
    ReadStatus {
        reason: String,
    },
    Bolus(BolusRequest),
    SmbBolus(BolusRequest),
    ExtendedBolus {
        insulin: f64,
        duration_min: u32,
    },
    CancelExtendedBolus,
    TempBasalAbsolute {
        /// U/h
        rate: f64,
        duration_min: u32,
        /// Re-issue even if the same temp basal is already running
        #[serde(default)]
        enforce_new: bool,
    },
    TempBasalPercent {
        percent: u32,
        duration_min: u32,
        #[serde(default)]
        enforce_new: bool,
    },
    CancelTempBasal {
        #[serde(default)]
        enforce_new: bool,
    },
    SetProfile(BasalProfile),
    StartPump,
    StopPump,
    LoadHistory {
        record_type: u8,
    },
    LoadEvents,
    LoadTdds,
    SetUserSettings {
        settings: BTreeMap<String, String>,
    },
    VendorSpecificNotification {
        key: String,
        enabled: bool,
    },
}

impl PumpCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            PumpCommand::ReadStatus { .. } => CommandKind::ReadStatus,
            PumpCommand::Bolus(_) => CommandKind::Bolus,
            PumpCommand::SmbBolus(_) => CommandKind::SmbBolus,
            PumpCommand::ExtendedBolus { .. } => CommandKind::ExtendedBolus,
            PumpCommand::CancelExtendedBolus => CommandKind::CancelExtendedBolus,
            PumpCommand::TempBasalAbsolute { .. } => CommandKind::TempBasalAbsolute,
            PumpCommand::TempBasalPercent { .. } => CommandKind::TempBasalPercent,
            PumpCommand::CancelTempBasal { .. } => CommandKind::CancelTempBasal,
            PumpCommand::SetProfile(_) => CommandKind::SetProfile,
            PumpCommand::StartPump => CommandKind::StartPump,
            PumpCommand::StopPump => CommandKind::StopPump,
            PumpCommand::LoadHistory { .. } => CommandKind::LoadHistory,
            PumpCommand::LoadEvents => CommandKind::LoadEvents,
            PumpCommand::LoadTdds => CommandKind::LoadTdds,
            PumpCommand::SetUserSettings { .. } => CommandKind::SetUserSettings,
            PumpCommand::VendorSpecificNotification { .. } => {
                CommandKind::VendorSpecificNotification
            }
        }
    }

    /// Bolus insulin carried by this command, if any.
    pub fn bolus_units(&self) -> Option<f64> {
        match self {
            PumpCommand::Bolus(b) | PumpCommand::SmbBolus(b) => Some(b.insulin),
            _ => None,
        }
    }

    /// Whether a pending `self` can absorb the new request `other`.
    pub fn coalesces_with(&self, other: &PumpCommand) -> bool {
        match (self, other) {
            (PumpCommand::ReadStatus { .. }, PumpCommand::ReadStatus { .. }) => true,
            (PumpCommand::LoadHistory { .. }, PumpCommand::LoadHistory { .. })
            | (PumpCommand::LoadEvents, PumpCommand::LoadEvents)
            | (PumpCommand::LoadTdds, PumpCommand::LoadTdds) => self == other,
            _ => false,
        }
    }

    /// Check the payload against pump limits.
    pub fn validate(&self, limits: &PumpLimits) -> Result<(), ValidationError> {
        match self {
            PumpCommand::Bolus(bolus) => {
                check_amount("insulin", bolus.insulin, limits.max_bolus)?;
                check_carbs(bolus.carbs, limits.max_carbs)
            }
            PumpCommand::SmbBolus(bolus) => {
                check_amount("insulin", bolus.insulin, limits.max_smb)?;
                check_carbs(bolus.carbs, limits.max_carbs)
            }
            PumpCommand::ExtendedBolus {
                insulin,
                duration_min,
            } => {
                check_amount("insulin", *insulin, limits.max_bolus)?;
                check_duration(*duration_min, limits)
            }
            PumpCommand::TempBasalAbsolute {
                rate, duration_min, ..
            } => {
                check_finite("rate", *rate)?;
                if *rate < 0.0 || *rate > limits.max_basal_rate {
                    return Err(ValidationError::out_of_range(
                        "rate",
                        *rate,
                        0.0,
                        limits.max_basal_rate,
                    ));
                }
                check_duration(*duration_min, limits)
            }
            PumpCommand::TempBasalPercent {
                percent,
                duration_min,
                ..
            } => {
                if *percent > limits.max_temp_percent {
                    return Err(ValidationError::out_of_range(
                        "percent",
                        f64::from(*percent),
                        0.0,
                        f64::from(limits.max_temp_percent),
                    ));
                }
                check_duration(*duration_min, limits)
            }
            PumpCommand::SetProfile(profile) => profile
                .validate(limits.max_basal_rate)
                .map_err(|e| ValidationError::Profile(e.to_string())),
            PumpCommand::VendorSpecificNotification { key, .. } => {
                if key.trim().is_empty() {
                    return Err(ValidationError::Empty {
                        field: "key".to_string(),
                    });
                }
                Ok(())
            }
            PumpCommand::SetUserSettings { settings } => {
                if settings.is_empty() {
                    return Err(ValidationError::Empty {
                        field: "settings".to_string(),
                    });
                }
                Ok(())
            }
            PumpCommand::ReadStatus { .. }
            | PumpCommand::CancelExtendedBolus
            | PumpCommand::CancelTempBasal { .. }
            | PumpCommand::StartPump
            | PumpCommand::StopPump
            | PumpCommand::LoadHistory { .. }
            | PumpCommand::LoadEvents
            | PumpCommand::LoadTdds => Ok(()),
        }
    }

    /// Short status line, e.g. for a queue overview.
    pub fn describe(&self) -> String {
        match self {
            PumpCommand::ReadStatus { reason } => format!("READSTATUS {}", reason),
            PumpCommand::Bolus(b) => format!("BOLUS {:.2}U", b.insulin),
            PumpCommand::SmbBolus(b) => format!("SMB BOLUS {:.2}U", b.insulin),
            PumpCommand::ExtendedBolus {
                insulin,
                duration_min,
            } => format!("EXTENDEDBOLUS {:.2}U {}min", insulin, duration_min),
            PumpCommand::CancelExtendedBolus => "CANCEL EXTENDEDBOLUS".to_string(),
            PumpCommand::TempBasalAbsolute {
                rate, duration_min, ..
            } => format!("TEMPBASAL {:.2}U/h {}min", rate, duration_min),
            PumpCommand::TempBasalPercent {
                percent,
                duration_min,
                ..
            } => format!("TEMPBASAL {}% {}min", percent, duration_min),
            PumpCommand::CancelTempBasal { .. } => "CANCEL TEMPBASAL".to_string(),
            PumpCommand::SetProfile(p) => format!("SETPROFILE {}", p.name),
            PumpCommand::StartPump => "START PUMP".to_string(),
            PumpCommand::StopPump => "STOP PUMP".to_string(),
            PumpCommand::LoadHistory { record_type } => format!("LOADHISTORY {}", record_type),
            PumpCommand::LoadEvents => "LOAD EVENTS".to_string(),
            PumpCommand::LoadTdds => "LOAD TDDs".to_string(),
            PumpCommand::SetUserSettings { settings } => {
                format!("SET USER SETTINGS ({} keys)", settings.len())
            }
            PumpCommand::VendorSpecificNotification { key, enabled } => {
                format!("NOTIFICATION {}={}", key, enabled)
            }
        }
    }
}

fn check_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NotFinite {
            field: field.to_string(),
        })
    }
}

fn check_amount(field: &str, value: f64, max: f64) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if value <= 0.0 {
        return Err(ValidationError::NotPositive {
            field: field.to_string(),
        });
    }
    if value > max {
        return Err(ValidationError::out_of_range(field, value, 0.0, max));
    }
    Ok(())
}

fn check_carbs(carbs: f64, max: f64) -> Result<(), ValidationError> {
    check_finite("carbs", carbs)?;
    if carbs < 0.0 || carbs > max {
        return Err(ValidationError::out_of_range("carbs", carbs, 0.0, max));
    }
    Ok(())
}

fn check_duration(minutes: u32, limits: &PumpLimits) -> Result<(), ValidationError> {
    if minutes == 0 || minutes % limits.duration_step_min != 0 || minutes > limits.max_duration_min {
        return Err(ValidationError::Duration {
            minutes,
            step: limits.duration_step_min,
            max: limits.max_duration_min,
        });
    }
    Ok(())
}

/// A command as submitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique command ID
    pub id: CommandId,
    pub command: PumpCommand,
    /// Derived from the command kind
    pub priority: CommandPriority,
    pub source: CommandSource,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    /// Create a new command request.
    pub fn new(command: PumpCommand, source: CommandSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: command.kind().priority(),
            command,
            source,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}
