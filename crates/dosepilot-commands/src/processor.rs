//! Queue executor.
//!
//! A single task that takes commands from the store one at a time,
//! connects to the pump, executes, reconciles after failures and resolves
//! the result. It is the only code that calls the driver or writes the
//! status tracker.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::Instrument;

use dosepilot_core::config::{DisconnectPolicy, QueueConfig};

use crate::command::{CommandRequest, PumpCommand};
use crate::dispatcher::ResultDispatcher;
use crate::driver::{DriverError, PumpDriver, PumpSnapshot};
use crate::error::CommandError;
use crate::events::{CommandEvent, CommandEventBus, CommandEventType};
use crate::queue::{PendingCommand, QueueStore};
use crate::reconcile::reconcile;
use crate::result::PumpEnactResult;
use crate::status::{ConnectivityState, ExecutorState, StatusTracker};

const SHUTDOWN_REASON: &str = "queue shut down";

/// Worker that owns the pump link.
pub(crate) struct QueueExecutor {
    config: QueueConfig,
    store: Arc<QueueStore>,
    driver: Arc<dyn PumpDriver>,
    status: Arc<StatusTracker>,
    dispatcher: Arc<ResultDispatcher>,
    events: Arc<CommandEventBus>,
    shutdown: watch::Receiver<bool>,
    connected: bool,
}

impl QueueExecutor {
    pub(crate) fn new(
        config: QueueConfig,
        store: Arc<QueueStore>,
        driver: Arc<dyn PumpDriver>,
        status: Arc<StatusTracker>,
        dispatcher: Arc<ResultDispatcher>,
        events: Arc<CommandEventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            driver,
            status,
            dispatcher,
            events,
            shutdown,
            connected: false,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown is signalled or the queue handle is gone.
    pub(crate) async fn run(mut self) {
        tracing::info!(driver = self.driver.name(), "Queue executor started");

        loop {
            if self.is_shutting_down() {
                break;
            }

            let Some(pending) = self.store.pop_highest_priority() else {
                if self.connected && self.config.disconnect_policy == DisconnectPolicy::WhenIdle {
                    self.status.set_executor(ExecutorState::Disconnecting, None);
                    self.disconnect().await;
                    self.status.set_executor(ExecutorState::Idle, None);
                }

                let sender_gone = tokio::select! {
                    _ = self.store.notified() => false,
                    changed = self.shutdown.changed() => changed.is_err(),
                };
                if sender_gone {
                    break;
                }
                continue;
            };

            let span = tracing::info_span!(
                "command",
                command_id = %pending.request.id,
                kind = %pending.request.kind()
            );
            self.process(pending).instrument(span).await;
        }

        self.disconnect().await;
        self.status.set_executor(ExecutorState::Idle, None);
        self.status.set_connectivity(ConnectivityState::Disconnected);
        tracing::info!("Queue executor stopped");
    }

    async fn process(&mut self, pending: PendingCommand) {
        let PendingCommand {
            request, mut waiters, ..
        } = pending;
        let id = request.id.clone();

        let result = match self.ensure_connected(&request).await {
            Ok(()) => self.execute(&request).await,
            Err(result) => result,
        };

        self.status.set_executor(ExecutorState::Disconnecting, None);
        waiters.extend(self.store.finish(&id));
        self.dispatcher.resolve(&request, waiters, result);

        if self.config.disconnect_policy == DisconnectPolicy::AfterEachCommand {
            self.disconnect().await;
        }
        self.status.set_executor(ExecutorState::Idle, None);
    }

    /// Connect with bounded exponential backoff. On failure returns the
    /// result to resolve the command with.
    async fn ensure_connected(&mut self, request: &CommandRequest) -> Result<(), PumpEnactResult> {
        if self.connected {
            return Ok(());
        }

        let kind = request.kind();
        self.status.set_executor(ExecutorState::Connecting, Some(kind));
        self.events.publish(CommandEvent::new(
            CommandEventType::Connecting,
            request.id.clone(),
            kind,
        ));

        let retry = self.config.retry.clone();
        let timeout = self.config.connect_timeout();
        let mut last_error = String::new();

        for attempt in 1..=retry.max_attempts {
            if self.is_shutting_down() {
                return Err(PumpEnactResult::cancelled(SHUTDOWN_REASON));
            }

            self.status.set_connectivity(ConnectivityState::Connecting);
            tracing::debug!(attempt, max_attempts = retry.max_attempts, "Connecting to pump");

            let outcome = tokio::select! {
                outcome = tokio::time::timeout(timeout, self.driver.connect(timeout)) => Some(outcome),
                _ = self.shutdown.changed() => None,
            };

            match outcome {
                None => {
                    self.driver.disconnect().await;
                    self.status.set_connectivity(ConnectivityState::Disconnected);
                    return Err(PumpEnactResult::cancelled(SHUTDOWN_REASON));
                }
                Some(Ok(Ok(()))) => {
                    self.connected = true;
                    self.status.set_connectivity(ConnectivityState::Connected);
                    tracing::debug!(attempt, "Pump connected");
                    return Ok(());
                }
                Some(Ok(Err(DriverError::Busy(message)))) => {
                    self.status.set_connectivity(ConnectivityState::PumpBusy);
                    last_error = format!("pump busy: {}", message);
                }
                Some(Ok(Err(err))) => {
                    self.status.set_connectivity(ConnectivityState::Disconnected);
                    last_error = err.to_string();
                }
                Some(Err(_elapsed)) => {
                    self.status.set_connectivity(ConnectivityState::Disconnected);
                    last_error = format!("connect timed out after {} ms", timeout.as_millis());
                }
            }

            tracing::warn!(
                attempt,
                max_attempts = retry.max_attempts,
                error = %last_error,
                "Pump connection attempt failed"
            );

            if attempt < retry.max_attempts {
                let delay = retry.delay_for_attempt(attempt);
                let aborted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = self.shutdown.changed() => true,
                };
                if aborted {
                    return Err(PumpEnactResult::cancelled(SHUTDOWN_REASON));
                }
            }
        }

        self.driver.disconnect().await;
        self.status.set_connectivity(ConnectivityState::Disconnected);
        tracing::error!(attempts = retry.max_attempts, error = %last_error, "Pump unreachable");
        Err(PumpEnactResult::failed(CommandError::ConnectionFailed {
            attempts: retry.max_attempts,
            message: last_error,
        }))
    }

    /// Execute one command. A clean timeout of a command that cannot change
    /// delivery is retried under the retry policy; anything that may have
    /// touched delivery is reconciled instead and never re-sent.
    async fn execute(&mut self, request: &CommandRequest) -> PumpEnactResult {
        let kind = request.kind();
        let max_attempts = self.config.retry.max_attempts;
        let timeout = match request.command.bolus_units() {
            Some(units) => self.config.bolus_timeout(units),
            None => self.config.execute_timeout(),
        };

        let mut attempt = 1;
        loop {
            self.status.set_executor(ExecutorState::Executing, Some(kind));
            self.events.publish(CommandEvent::new(
                CommandEventType::Executing,
                request.id.clone(),
                kind,
            ));

            let dispatched_at = Utc::now();
            tracing::info!(
                command = %request.command.describe(),
                source = %request.source.id(),
                attempt,
                "Executing"
            );

            let outcome = match tokio::time::timeout(timeout, self.driver.execute(&request.command)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DriverError::Timeout { partial: false }),
            };

            let err = match outcome {
                Ok(response) => {
                    match (&request.command, response.snapshot.clone()) {
                        (_, Some(snapshot)) => self.status.record_snapshot(snapshot),
                        (PumpCommand::StopPump, None) => self.status.set_suspended(true),
                        (PumpCommand::StartPump, None) => self.status.set_suspended(false),
                        _ => {}
                    }
                    tracing::info!(enacted = response.enacted, comment = %response.comment, "Command succeeded");
                    return PumpEnactResult::from_response(&response);
                }
                Err(err) => err,
            };

            tracing::warn!(error = %err, attempt, "Command failed at the pump");
            match err {
                DriverError::Rejected(_) => {}
                DriverError::Busy(_) => {
                    self.status.set_connectivity(ConnectivityState::PumpBusy);
                }
                _ => self.mark_link_lost().await,
            }

            if kind.is_dose_affecting() || err.is_partial() {
                return self.reconcile(request, dispatched_at, &err).await;
            }

            let clean_timeout = matches!(err, DriverError::Timeout { partial: false });
            if !clean_timeout || attempt >= max_attempts {
                return PumpEnactResult::failed(err.into());
            }

            if let Err(result) = self.retry_after(request, attempt).await {
                return result;
            }
            attempt += 1;
        }
    }

    /// Back off, then reconnect for another execute attempt.
    async fn retry_after(&mut self, request: &CommandRequest, attempt: u32) -> Result<(), PumpEnactResult> {
        if self.is_shutting_down() {
            return Err(PumpEnactResult::cancelled(SHUTDOWN_REASON));
        }

        let delay = self.config.retry.delay_for_attempt(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying command after timeout");
        let aborted = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        };
        if aborted {
            return Err(PumpEnactResult::cancelled(SHUTDOWN_REASON));
        }

        self.ensure_connected(request).await
    }

    /// Read the pump status after a failure and decide what happened.
    async fn reconcile(
        &mut self,
        request: &CommandRequest,
        dispatched_at: chrono::DateTime<Utc>,
        failure: &DriverError,
    ) -> PumpEnactResult {
        self.events.publish(
            CommandEvent::new(CommandEventType::Reconciling, request.id.clone(), request.kind())
                .with_data(serde_json::json!({ "error": failure.to_string() })),
        );
        tracing::info!(error = %failure, "Reconciling pump state");

        let snapshot = self.read_status().await;
        let result = reconcile(&request.command, dispatched_at, failure, snapshot.as_ref());

        if result.is_unverified() {
            tracing::error!(comment = %result.comment, "Delivery unverified");
        } else {
            tracing::info!(success = result.success, enacted = result.enacted, "Reconciled");
        }
        result
    }

    /// One status read with a single connection attempt.
    async fn read_status(&mut self) -> Option<PumpSnapshot> {
        let timeout = self.config.connect_timeout();
        if !self.connected {
            self.status.set_connectivity(ConnectivityState::Connecting);
            match tokio::time::timeout(timeout, self.driver.connect(timeout)).await {
                Ok(Ok(())) => {
                    self.connected = true;
                    self.status.set_connectivity(ConnectivityState::Connected);
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "Reconnect for status read failed");
                    self.status.set_connectivity(ConnectivityState::Disconnected);
                    return None;
                }
                Err(_) => {
                    tracing::warn!("Reconnect for status read timed out");
                    self.status.set_connectivity(ConnectivityState::Disconnected);
                    return None;
                }
            }
        }

        let command = PumpCommand::ReadStatus {
            reason: "reconcile".to_string(),
        };
        match tokio::time::timeout(self.config.status_timeout(), self.driver.execute(&command)).await {
            Ok(Ok(response)) => {
                let snapshot = response.snapshot?;
                self.status.record_snapshot(snapshot.clone());
                Some(snapshot)
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Status read failed");
                self.mark_link_lost().await;
                None
            }
            Err(_) => {
                tracing::warn!("Status read timed out");
                self.mark_link_lost().await;
                None
            }
        }
    }

    async fn mark_link_lost(&mut self) {
        self.driver.disconnect().await;
        self.connected = false;
        self.status.set_connectivity(ConnectivityState::Disconnected);
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.driver.disconnect().await;
        self.connected = false;
        self.status.set_connectivity(ConnectivityState::Disconnected);
        tracing::debug!("Pump disconnected");
    }
}
