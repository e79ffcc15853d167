//! Queue store.
//!
//! Pending commands ordered by priority, then insertion order. Admission
//! applies the merge rules of each conflict class under one lock, so at
//! most one pending command per superseding class exists at any time.
//! Displaced and rejected commands are resolved after the lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::command::{CommandId, CommandKind, CommandPriority, CommandRequest, MergeRule, PumpCommand};
use crate::dispatcher::{Completion, ResultDispatcher};
use crate::error::RejectReason;
use crate::events::{CommandEvent, CommandEventBus, CommandEventType};
use crate::result::PumpEnactResult;

/// Outcome of submitting a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    /// Queued, nothing displaced.
    Accepted { id: CommandId },
    /// Queued, displacing older commands of the same class.
    Replaced { id: CommandId, previous: Vec<CommandId> },
    /// Attached to an identical pending or in-flight command.
    Coalesced { id: CommandId, into: CommandId },
    /// Refused; the ticket is already resolved.
    Rejected { id: CommandId, reason: RejectReason },
}

impl Admission {
    pub fn id(&self) -> &str {
        match self {
            Admission::Accepted { id }
            | Admission::Replaced { id, .. }
            | Admission::Coalesced { id, .. }
            | Admission::Rejected { id, .. } => id,
        }
    }

    /// The request will be answered by a pump execution.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Ordering key. Priority is inverted so higher priority sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: u8,
    sequence: u64,
}

impl QueueKey {
    fn new(priority: CommandPriority, sequence: u64) -> Self {
        Self {
            rank: 6 - priority.value(),
            sequence,
        }
    }
}

/// A queued command and everyone waiting for it.
#[derive(Debug)]
pub struct PendingCommand {
    pub request: CommandRequest,
    /// Insertion order
    pub sequence: u64,
    pub waiters: Vec<Completion>,
}

#[derive(Debug)]
struct InFlight {
    id: CommandId,
    kind: CommandKind,
    command: PumpCommand,
    description: String,
    started_at: DateTime<Utc>,
    /// Callers that coalesced after execution began
    late_waiters: Vec<Completion>,
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of commands pending
    pub total_count: usize,
    /// Pending count by priority, highest first
    pub by_priority: Vec<(CommandPriority, usize)>,
    pub in_flight: Option<CommandKind>,
    pub accepted: u64,
    pub coalesced: u64,
    pub superseded: u64,
    pub rejected: u64,
    pub cancelled: u64,
    /// Commands the executor finished
    pub processed: u64,
}

#[derive(Default)]
struct Counters {
    accepted: u64,
    coalesced: u64,
    superseded: u64,
    rejected: u64,
    cancelled: u64,
    processed: u64,
}

struct StoreInner {
    pending: BTreeMap<QueueKey, PendingCommand>,
    in_flight: Option<InFlight>,
    closed: bool,
    next_sequence: u64,
    counters: Counters,
}

impl StoreInner {
    /// Attach `completion` to the in-flight or pending command that
    /// `command` coalesces with. Hands the completion back if there is none.
    fn coalesce(&mut self, command: &PumpCommand, completion: Completion) -> Result<CommandId, Completion> {
        if let Some(flight) = self
            .in_flight
            .as_mut()
            .filter(|f| f.command.coalesces_with(command))
        {
            flight.late_waiters.push(completion);
            return Ok(flight.id.clone());
        }
        match self
            .pending
            .values_mut()
            .find(|p| p.request.command.coalesces_with(command))
        {
            Some(target) => {
                target.waiters.push(completion);
                Ok(target.request.id.clone())
            }
            None => Err(completion),
        }
    }
}

/// Ordered pending commands with merge, supersede and cancel logic.
pub struct QueueStore {
    inner: Mutex<StoreInner>,
    max_size: usize,
    notify: Notify,
    dispatcher: Arc<ResultDispatcher>,
    events: Arc<CommandEventBus>,
}

impl QueueStore {
    pub fn new(max_size: usize, dispatcher: Arc<ResultDispatcher>, events: Arc<CommandEventBus>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                pending: BTreeMap::new(),
                in_flight: None,
                closed: false,
                next_sequence: 0,
                counters: Counters::default(),
            }),
            max_size,
            notify: Notify::new(),
            dispatcher,
            events,
        }
    }

    /// Admit `request`, applying the merge rules of its conflict class.
    pub fn add(&self, request: CommandRequest, completion: Completion) -> Admission {
        let id = request.id.clone();
        let kind = request.kind();
        let mut inner = self.inner.lock();

        if inner.closed {
            drop(inner);
            return self.reject(request, completion, RejectReason::Closed);
        }

        if kind == CommandKind::SmbBolus {
            let bolus_busy = inner.pending.values().any(|p| p.request.kind().is_bolus())
                || inner.in_flight.as_ref().is_some_and(|f| f.kind.is_bolus());
            if bolus_busy {
                drop(inner);
                return self.reject(request, completion, RejectReason::BolusInProgress);
            }
        }

        let class = kind.conflict_class();
        let rule = class.merge_rule();

        let completion = if rule == MergeRule::Coalesce {
            let coalesced = inner.coalesce(&request.command, completion);
            match coalesced {
                Ok(into) => {
                    inner.counters.coalesced += 1;
                    drop(inner);

                    tracing::debug!(command_id = %id, into = %into, kind = %kind, "Request coalesced");
                    self.events.publish(
                        CommandEvent::new(CommandEventType::Coalesced, id.clone(), kind)
                            .with_data(serde_json::json!({ "into": into })),
                    );
                    return Admission::Coalesced { id, into };
                }
                Err(completion) => completion,
            }
        } else {
            completion
        };

        let conflicting: Vec<QueueKey> = if rule == MergeRule::Supersede {
            inner
                .pending
                .iter()
                .filter(|(_, p)| p.request.kind().conflict_class() == class)
                .map(|(key, _)| *key)
                .collect()
        } else {
            Vec::new()
        };

        if inner.pending.len() - conflicting.len() >= self.max_size {
            drop(inner);
            return self.reject(request, completion, RejectReason::Full);
        }

        let displaced: Vec<PendingCommand> = conflicting
            .iter()
            .filter_map(|key| inner.pending.remove(key))
            .collect();

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.counters.accepted += 1;
        inner.counters.superseded += displaced.len() as u64;
        let key = QueueKey::new(request.priority, sequence);
        let queued_len = inner.pending.len() + 1;
        inner.pending.insert(
            key,
            PendingCommand {
                request,
                sequence,
                waiters: vec![completion],
            },
        );
        drop(inner);

        let previous: Vec<CommandId> = displaced.iter().map(|p| p.request.id.clone()).collect();
        for old in displaced {
            tracing::info!(command_id = %old.request.id, by = %id, kind = %old.request.kind(), "Command superseded");
            self.dispatcher
                .resolve(&old.request, old.waiters, PumpEnactResult::superseded(id.clone()));
        }

        tracing::debug!(command_id = %id, kind = %kind, queued = queued_len, "Command queued");
        self.events
            .publish(CommandEvent::new(CommandEventType::Queued, id.clone(), kind));
        self.notify.notify_one();

        if previous.is_empty() {
            Admission::Accepted { id }
        } else {
            Admission::Replaced { id, previous }
        }
    }

    /// Resolve `request` as rejected without queuing it.
    pub fn reject(&self, request: CommandRequest, completion: Completion, reason: RejectReason) -> Admission {
        self.inner.lock().counters.rejected += 1;
        tracing::info!(command_id = %request.id, kind = %request.kind(), reason = %reason, "Command rejected");
        let id = request.id.clone();
        self.dispatcher
            .resolve(&request, vec![completion], PumpEnactResult::rejected(reason.clone()));
        Admission::Rejected { id, reason }
    }

    /// Remove the head of the queue and mark it in flight.
    pub fn pop_highest_priority(&self) -> Option<PendingCommand> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let (_, command) = inner.pending.pop_first()?;
        inner.in_flight = Some(InFlight {
            id: command.request.id.clone(),
            kind: command.request.kind(),
            command: command.request.command.clone(),
            description: command.request.command.describe(),
            started_at: Utc::now(),
            late_waiters: Vec::new(),
        });
        Some(command)
    }

    /// Clear the in-flight marker for `id` and return the callers that
    /// coalesced into it while it ran. They share its result.
    pub fn finish(&self, id: &str) -> Vec<Completion> {
        let mut inner = self.inner.lock();
        if !inner.in_flight.as_ref().is_some_and(|f| f.id == id) {
            return Vec::new();
        }
        inner.counters.processed += 1;
        match inner.in_flight.take() {
            Some(done) => {
                tracing::trace!(
                    command_id = %done.id,
                    late_callers = done.late_waiters.len(),
                    elapsed_ms = (Utc::now() - done.started_at).num_milliseconds(),
                    "Command finished"
                );
                done.late_waiters
            }
            None => Vec::new(),
        }
    }

    /// Ids of pending commands in the same conflict class as `kind`.
    pub fn peek_conflicts(&self, kind: CommandKind) -> Vec<CommandId> {
        let class = kind.conflict_class();
        self.inner
            .lock()
            .pending
            .values()
            .filter(|p| p.request.kind().conflict_class() == class)
            .map(|p| p.request.id.clone())
            .collect()
    }

    /// Cancel every pending command. The in-flight command is untouched.
    pub fn clear_all(&self, reason: &str) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            let drained = std::mem::take(&mut inner.pending);
            inner.counters.cancelled += drained.len() as u64;
            drained
        };

        let count = drained.len();
        if count > 0 {
            tracing::info!(count, reason, "Clearing pending commands");
        }
        for (_, pending) in drained {
            self.dispatcher
                .resolve(&pending.request, pending.waiters, PumpEnactResult::cancelled(reason));
        }
        count
    }

    /// Refuse all further admissions and stop handing out work.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Resolves when work may be available.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Number of pending commands, excluding the one in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// A command of `kind` is waiting.
    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.inner
            .lock()
            .pending
            .values()
            .any(|p| p.request.kind() == kind)
    }

    /// A command of `kind` is being executed.
    pub fn is_running(&self, kind: CommandKind) -> bool {
        self.performing() == Some(kind)
    }

    pub fn performing(&self) -> Option<CommandKind> {
        self.inner.lock().in_flight.as_ref().map(|f| f.kind)
    }

    /// Human readable overview of the in-flight and queued commands.
    pub fn status_text(&self) -> String {
        let inner = self.inner.lock();
        let mut lines = Vec::with_capacity(inner.pending.len() + 1);
        if let Some(ref flight) = inner.in_flight {
            lines.push(format!("Performing: {}", flight.description));
        }
        for (index, pending) in inner.pending.values().enumerate() {
            lines.push(format!("{}. {}", index + 1, pending.request.command.describe()));
        }
        if lines.is_empty() {
            "Queue empty".to_string()
        } else {
            lines.join("\n")
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let by_priority = CommandPriority::ALL
            .iter()
            .rev()
            .map(|priority| {
                let count = inner
                    .pending
                    .values()
                    .filter(|p| p.request.priority == *priority)
                    .count();
                (*priority, count)
            })
            .collect();

        QueueStats {
            total_count: inner.pending.len(),
            by_priority,
            in_flight: inner.in_flight.as_ref().map(|f| f.kind),
            accepted: inner.counters.accepted,
            coalesced: inner.counters.coalesced,
            superseded: inner.counters.superseded,
            rejected: inner.counters.rejected,
            cancelled: inner.counters.cancelled,
            processed: inner.counters.processed,
        }
    }
}
