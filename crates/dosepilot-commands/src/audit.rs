//! Audit trail of resolved commands.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::command::{CommandId, CommandKind, CommandRequest, CommandSource, PumpCommand};
use crate::result::PumpEnactResult;

/// One resolved command, as handed to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub command: PumpCommand,
    pub source: CommandSource,
    pub created_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    /// Callers that received this result (coalesced requests included)
    pub callers: usize,
    pub result: PumpEnactResult,
}

impl AuditRecord {
    pub fn new(request: &CommandRequest, callers: usize, result: PumpEnactResult) -> Self {
        Self {
            command_id: request.id.clone(),
            kind: request.kind(),
            command: request.command.clone(),
            source: request.source.clone(),
            created_at: request.created_at,
            resolved_at: Utc::now(),
            callers,
            result,
        }
    }

    /// A dose-affecting command failed at the pump or could not be
    /// verified.
    pub fn requires_attention(&self) -> bool {
        self.kind.is_dose_affecting()
            && !self.result.success
            && self
                .result
                .error
                .as_ref()
                .is_some_and(|e| e.is_device_failure())
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Writes audit records to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        let payload = serde_json::to_string(&record.command).unwrap_or_default();
        if record.result.success {
            tracing::info!(
                command_id = %record.command_id,
                kind = %record.kind,
                source = %record.source.id(),
                enacted = record.result.enacted,
                callers = record.callers,
                payload = %payload,
                "Command resolved"
            );
        } else {
            tracing::warn!(
                command_id = %record.command_id,
                kind = %record.kind,
                source = %record.source.id(),
                code = record.result.code(),
                enacted = record.result.enacted,
                payload = %payload,
                comment = %record.result.comment,
                "Command failed"
            );
        }
    }
}

/// In-memory sink for testing.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    /// Records for one command.
    pub fn for_command(&self, id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.command_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}
