//! User alerts for failed or unverified dosing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::AuditRecord;
use crate::command::{CommandId, CommandKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    /// The user must check the pump now
    Urgent,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Urgent => "urgent",
        };
        write!(f, "{}", s)
    }
}

/// Alert raised for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpAlert {
    pub id: String,
    pub severity: AlertSeverity,
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl PumpAlert {
    /// Alert for a record that needs attention, if any.
    pub fn from_record(record: &AuditRecord) -> Option<Self> {
        if !record.requires_attention() {
            return None;
        }

        let (severity, title) = if record.result.is_unverified() {
            (
                AlertSeverity::Urgent,
                format!("Verify {} on the pump", record.kind),
            )
        } else {
            (AlertSeverity::Warning, format!("{} failed", record.kind))
        };

        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            command_id: record.command_id.clone(),
            kind: record.kind,
            title,
            message: format!("{}: {}", record.command.describe(), record.result.comment),
            created_at: Utc::now(),
        })
    }
}

/// Alert delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: PumpAlert);
}

/// Logs alerts at warn/error level.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: PumpAlert) {
        match alert.severity {
            AlertSeverity::Urgent => tracing::error!(
                command_id = %alert.command_id,
                kind = %alert.kind,
                "{}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                command_id = %alert.command_id,
                kind = %alert.kind,
                "{}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Info => tracing::info!(
                command_id = %alert.command_id,
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
    }
}

/// In-memory notifier for testing.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<PumpAlert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<PumpAlert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, alert: PumpAlert) {
        self.alerts.lock().push(alert);
    }
}
