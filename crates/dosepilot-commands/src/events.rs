//! Command lifecycle events.
//!
//! Every admission decision and executor step is published on a broadcast
//! bus. A bounded buffer keeps the most recent events for diagnostics.
//! Publishing never blocks; slow subscribers lag and lose events.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::command::{CommandId, CommandKind, CommandPriority};
use crate::result::PumpEnactResult;

/// Command lifecycle event types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandEventType {
    /// Command admitted to the queue
    Queued,
    /// Request attached to an identical pending command
    Coalesced,
    /// Pending command displaced by a newer one
    Superseded,
    /// Command refused at admission
    Rejected,
    /// Executor connecting to the pump for this command
    Connecting,
    /// Command sent to the pump
    Executing,
    /// Status read issued after a device failure
    Reconciling,
    /// Command completed successfully
    Completed,
    /// Command failed
    Failed,
    /// Command removed by a reset or shutdown
    Cancelled,
}

/// Command event with context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    pub id: String,
    pub event_type: CommandEventType,
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub priority: CommandPriority,
    pub timestamp: DateTime<Utc>,
    /// Result (if completed/failed)
    pub result: Option<PumpEnactResult>,
    /// Additional event data
    pub data: Option<serde_json::Value>,
}

impl CommandEvent {
    pub fn new(event_type: CommandEventType, command_id: CommandId, kind: CommandKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            command_id,
            kind,
            priority: kind.priority(),
            timestamp: Utc::now(),
            result: None,
            data: None,
        }
    }

    pub fn with_result(mut self, result: PumpEnactResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Event type that closes a command's lifecycle for `result`.
    pub fn terminal_type(result: &PumpEnactResult) -> CommandEventType {
        use crate::error::CommandError;
        match &result.error {
            None => CommandEventType::Completed,
            Some(CommandError::Superseded { .. }) => CommandEventType::Superseded,
            Some(CommandError::Cancelled { .. }) => CommandEventType::Cancelled,
            Some(CommandError::Rejected(_)) | Some(CommandError::Validation(_)) => {
                CommandEventType::Rejected
            }
            Some(_) => CommandEventType::Failed,
        }
    }
}

/// Event filter for subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub command_id: Option<CommandId>,
    pub kinds: Option<Vec<CommandKind>>,
    pub event_types: Option<Vec<CommandEventType>>,
    /// Only events at or above this priority
    pub min_priority: Option<CommandPriority>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = CommandKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn event_types(mut self, types: impl IntoIterator<Item = CommandEventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    pub fn command(mut self, id: impl Into<CommandId>) -> Self {
        self.command_id = Some(id.into());
        self
    }

    pub fn min_priority(mut self, priority: CommandPriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &CommandEvent) -> bool {
        if let Some(ref id) = self.command_id {
            if &event.command_id != id {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(ref event_types) = self.event_types {
            if !event_types.contains(&event.event_type) {
                return false;
            }
        }

        if let Some(min) = self.min_priority {
            if event.priority < min {
                return false;
            }
        }

        true
    }
}

/// Event bus for command events.
pub struct CommandEventBus {
    broadcast_tx: broadcast::Sender<CommandEvent>,
    recent_events: Mutex<VecDeque<CommandEvent>>,
    max_stored: usize,
}

impl CommandEventBus {
    pub fn new(max_stored: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(max_stored.max(16));

        Self {
            broadcast_tx,
            recent_events: Mutex::new(VecDeque::with_capacity(max_stored)),
            max_stored,
        }
    }

    /// Publish an event.
    pub fn publish(&self, event: CommandEvent) {
        tracing::trace!(
            command_id = %event.command_id,
            kind = %event.kind,
            event = ?event.event_type,
            "Command event"
        );

        {
            let mut events = self.recent_events.lock();
            if self.max_stored > 0 {
                if events.len() >= self.max_stored {
                    events.pop_front();
                }
                events.push_back(event.clone());
            }
        }

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe with a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        FilteredSubscriber {
            rx: self.broadcast_tx.subscribe(),
            filter,
        }
    }

    /// The last `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<CommandEvent> {
        let events = self.recent_events.lock();
        let start = events.len().saturating_sub(limit);
        events.iter().skip(start).cloned().collect()
    }

    /// Stored events matching `filter`, oldest first.
    pub fn query(&self, filter: &EventFilter) -> Vec<CommandEvent> {
        self.recent_events
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Stored events for one command.
    pub fn for_command(&self, command_id: &str) -> Vec<CommandEvent> {
        self.query(&EventFilter::new().command(command_id))
    }

    pub fn clear(&self) {
        self.recent_events.lock().clear();
    }
}

impl Default for CommandEventBus {
    fn default() -> Self {
        Self::new(dosepilot_core::config::defaults::EVENT_BUFFER_SIZE)
    }
}

/// Filtered event subscriber.
pub struct FilteredSubscriber {
    rx: broadcast::Receiver<CommandEvent>,
    filter: EventFilter,
}

impl FilteredSubscriber {
    /// Receive next filtered event.
    pub async fn recv(&mut self) -> Result<CommandEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive next filtered event without blocking.
    pub fn try_recv(&mut self) -> Result<CommandEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: CommandEventType, id: &str, kind: CommandKind) -> CommandEvent {
        CommandEvent::new(event_type, id.to_string(), kind)
    }

    #[test]
    fn test_filter_matching() {
        let e = event(CommandEventType::Queued, "a", CommandKind::Bolus);

        assert!(EventFilter::new().matches(&e));
        assert!(EventFilter::new().kinds([CommandKind::Bolus]).matches(&e));
        assert!(!EventFilter::new().kinds([CommandKind::LoadTdds]).matches(&e));
        assert!(!EventFilter::new()
            .event_types([CommandEventType::Failed])
            .matches(&e));
        assert!(EventFilter::new()
            .min_priority(CommandPriority::High)
            .matches(&e));
        assert!(!EventFilter::new()
            .min_priority(CommandPriority::Emergency)
            .matches(&e));
        assert!(!EventFilter::new().command("b").matches(&e));
    }

    #[test]
    fn test_recent_buffer_is_bounded() {
        let bus = CommandEventBus::new(3);
        for i in 0..5 {
            bus.publish(event(CommandEventType::Queued, &i.to_string(), CommandKind::LoadEvents));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].command_id, "2");
        assert_eq!(bus.recent(1)[0].command_id, "4");
    }

    #[test]
    fn test_for_command() {
        let bus = CommandEventBus::new(10);
        bus.publish(event(CommandEventType::Queued, "x", CommandKind::Bolus));
        bus.publish(event(CommandEventType::Queued, "y", CommandKind::Bolus));
        bus.publish(event(CommandEventType::Executing, "x", CommandKind::Bolus));
        assert_eq!(bus.for_command("x").len(), 2);
        bus.clear();
        assert!(bus.recent(10).is_empty());
    }

    #[tokio::test]
    async fn test_filtered_subscriber() {
        let bus = CommandEventBus::new(10);
        let mut sub = bus.subscribe_filtered(
            EventFilter::new().event_types([CommandEventType::Completed]),
        );

        bus.publish(event(CommandEventType::Queued, "a", CommandKind::ReadStatus));
        bus.publish(event(CommandEventType::Completed, "a", CommandKind::ReadStatus));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_type, CommandEventType::Completed);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn test_terminal_type() {
        assert_eq!(
            CommandEvent::terminal_type(&PumpEnactResult::cancelled("stop")),
            CommandEventType::Cancelled
        );
        assert_eq!(
            CommandEvent::terminal_type(&PumpEnactResult::superseded("n")),
            CommandEventType::Superseded
        );
    }
}
