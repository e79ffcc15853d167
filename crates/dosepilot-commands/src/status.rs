//! Connection and pump status tracking.
//!
//! Only the executor writes; anyone can read without blocking or subscribe
//! to changes through a `watch` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::command::CommandKind;
use crate::driver::PumpSnapshot;

/// Reachability of the pump as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    Connecting,
    #[default]
    Disconnected,
    /// Reachable but occupied by a user on the pump itself
    PumpBusy,
    Suspended,
}

/// Where the executor is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    #[default]
    Idle,
    Connecting,
    Executing,
    Disconnecting,
}

/// Point-in-time view of the pump and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    /// Link state, without the suspended overlay
    pub connectivity: ConnectivityState,
    pub executor: ExecutorState,
    /// Kind currently executing
    pub performing: Option<CommandKind>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_snapshot: Option<PumpSnapshot>,
    /// Last known delivery suspension
    pub suspended: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for PumpStatus {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityState::Disconnected,
            executor: ExecutorState::Idle,
            performing: None,
            last_connected_at: None,
            last_snapshot: None,
            suspended: false,
            updated_at: Utc::now(),
        }
    }
}

impl PumpStatus {
    /// Connectivity with a suspended pump reported as `Suspended`.
    pub fn state(&self) -> ConnectivityState {
        if self.suspended {
            ConnectivityState::Suspended
        } else {
            self.connectivity
        }
    }
}

/// Holder of the current [`PumpStatus`].
pub struct StatusTracker {
    tx: watch::Sender<PumpStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PumpStatus::default());
        Self { tx }
    }

    /// Copy of the current status.
    pub fn current(&self) -> PumpStatus {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.tx.borrow().state()
    }

    pub fn is_suspended(&self) -> bool {
        self.tx.borrow().suspended
    }

    /// Receiver that wakes on every change.
    pub fn subscribe(&self) -> watch::Receiver<PumpStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PumpStatus),
    {
        self.tx.send_modify(|status| {
            f(status);
            status.updated_at = Utc::now();
        });
    }

    pub(crate) fn set_connectivity(&self, connectivity: ConnectivityState) {
        self.update(|s| {
            s.connectivity = connectivity;
            if connectivity == ConnectivityState::Connected {
                s.last_connected_at = Some(Utc::now());
            }
        });
    }

    pub(crate) fn set_executor(&self, executor: ExecutorState, performing: Option<CommandKind>) {
        self.update(|s| {
            s.executor = executor;
            s.performing = performing;
        });
    }

    pub(crate) fn record_snapshot(&self, snapshot: PumpSnapshot) {
        self.update(|s| {
            s.suspended = snapshot.suspended;
            s.last_snapshot = Some(snapshot);
        });
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.update(|s| s.suspended = suspended);
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_disconnected() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.state(), ConnectivityState::Disconnected);
        assert_eq!(tracker.current().executor, ExecutorState::Idle);
    }

    #[test]
    fn test_suspended_overlays_connectivity() {
        let tracker = StatusTracker::new();
        tracker.set_connectivity(ConnectivityState::Connected);
        assert!(tracker.current().last_connected_at.is_some());

        let snapshot = PumpSnapshot {
            suspended: true,
            ..PumpSnapshot::unknown()
        };
        tracker.record_snapshot(snapshot);
        assert_eq!(tracker.state(), ConnectivityState::Suspended);
        assert_eq!(tracker.current().connectivity, ConnectivityState::Connected);

        tracker.set_suspended(false);
        assert_eq!(tracker.state(), ConnectivityState::Connected);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();
        tracker.set_executor(ExecutorState::Executing, Some(CommandKind::Bolus));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().performing, Some(CommandKind::Bolus));
    }
}
