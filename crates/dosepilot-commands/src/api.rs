//! Public handle of the pump command queue.
//!
//! ```ignore
//! let queue = PumpCommandQueue::builder()
//!     .config(QueueConfig::from_env()?)
//!     .driver(Arc::new(my_driver))
//!     .build()?;
//! queue.start()?;
//!
//! let submission = queue.temp_basal_absolute(0.0, 30, false, CommandSource::system("low"));
//! let result = submission.ticket.await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use dosepilot_core::config::QueueConfig;
use dosepilot_core::dosing::{BasalAction, DosingRecommendation};
use dosepilot_core::therapy::BasalProfile;

use crate::audit::{AuditRecord, AuditSink, TracingAuditSink};
use crate::command::{BolusRequest, CommandId, CommandKind, CommandRequest, CommandSource, PumpCommand};
use crate::dispatcher::{forward_record, spawn_audit_forwarder, CommandTicket, Completion, ResultDispatcher};
use crate::driver::PumpDriver;
use crate::error::RejectReason;
use crate::events::CommandEventBus;
use crate::notify::{LogNotifier, Notifier};
use crate::processor::QueueExecutor;
use crate::queue::{Admission, QueueStats, QueueStore};
use crate::result::PumpEnactResult;
use crate::status::{ConnectivityState, PumpStatus, StatusTracker};

/// Lifecycle errors of the queue handle.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue executor already started")]
    AlreadyStarted,

    #[error("Queue is shut down")]
    Closed,

    #[error("No pump driver configured")]
    MissingDriver,

    #[error("Invalid configuration: {0}")]
    Config(#[from] dosepilot_core::Error),
}

/// Admission decision plus the caller's ticket.
#[derive(Debug)]
pub struct Submission {
    pub admission: Admission,
    pub ticket: CommandTicket,
}

impl Submission {
    pub fn id(&self) -> &str {
        self.admission.id()
    }

    pub fn is_admitted(&self) -> bool {
        self.admission.is_admitted()
    }

    /// Wait for the result.
    pub async fn result(self) -> PumpEnactResult {
        self.ticket.await
    }
}

/// Builder for [`PumpCommandQueue`].
#[derive(Default)]
pub struct PumpCommandQueueBuilder {
    config: QueueConfig,
    driver: Option<Arc<dyn PumpDriver>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PumpCommandQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn PumpDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Defaults to [`LogNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<PumpCommandQueue, QueueError> {
        self.config.validate()?;
        let driver = self.driver.ok_or(QueueError::MissingDriver)?;

        let events = Arc::new(CommandEventBus::new(self.config.event_buffer_size));
        let (dispatcher, audit_rx) = ResultDispatcher::new(events.clone());
        let dispatcher = Arc::new(dispatcher);
        let store = Arc::new(QueueStore::new(
            self.config.max_queue_size,
            dispatcher.clone(),
            events.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(PumpCommandQueue {
            inner: Arc::new(QueueInner {
                config: self.config,
                store,
                status: Arc::new(StatusTracker::new()),
                events,
                dispatcher,
                driver,
                audit_sink: self
                    .audit_sink
                    .unwrap_or_else(|| Arc::new(TracingAuditSink)),
                notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
                shutdown_tx,
                audit_rx: Mutex::new(Some(audit_rx)),
                executor: Mutex::new(None),
                forwarder: Mutex::new(None),
            }),
        })
    }
}

struct QueueInner {
    config: QueueConfig,
    store: Arc<QueueStore>,
    status: Arc<StatusTracker>,
    events: Arc<CommandEventBus>,
    dispatcher: Arc<ResultDispatcher>,
    driver: Arc<dyn PumpDriver>,
    audit_sink: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    shutdown_tx: watch::Sender<bool>,
    /// Held until `start` hands it to the forwarder
    audit_rx: Mutex<Option<mpsc::UnboundedReceiver<AuditRecord>>>,
    executor: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the pump command queue.
///
/// Enqueueing never blocks and never touches the pump; commands may be
/// submitted before [`start`](Self::start) and are executed once the
/// executor runs.
#[derive(Clone)]
pub struct PumpCommandQueue {
    inner: Arc<QueueInner>,
}

impl PumpCommandQueue {
    pub fn builder() -> PumpCommandQueueBuilder {
        PumpCommandQueueBuilder::default()
    }

    /// Spawn the executor and audit forwarder. Requires a Tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        if self.inner.store.is_closed() {
            return Err(QueueError::Closed);
        }
        let mut executor = self.inner.executor.lock();
        if executor.is_some() {
            return Err(QueueError::AlreadyStarted);
        }
        let audit_rx = self
            .inner
            .audit_rx
            .lock()
            .take()
            .ok_or(QueueError::AlreadyStarted)?;

        *self.inner.forwarder.lock() = Some(spawn_audit_forwarder(
            audit_rx,
            self.inner.audit_sink.clone(),
            self.inner.notifier.clone(),
        ));

        let worker = QueueExecutor::new(
            self.inner.config.clone(),
            self.inner.store.clone(),
            self.inner.driver.clone(),
            self.inner.status.clone(),
            self.inner.dispatcher.clone(),
            self.inner.events.clone(),
            self.inner.shutdown_tx.subscribe(),
        );
        *executor = Some(tokio::spawn(worker.run()));

        tracing::info!(
            driver = self.inner.driver.name(),
            max_queue_size = self.inner.config.max_queue_size,
            disconnect_policy = ?self.inner.config.disconnect_policy,
            "Pump command queue started"
        );
        Ok(())
    }

    /// Executor task is running.
    pub fn is_started(&self) -> bool {
        self.inner
            .executor
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Validate and submit a command.
    pub fn enqueue(&self, command: PumpCommand, source: CommandSource) -> Submission {
        let request = CommandRequest::new(command, source);
        let (completion, ticket) = Completion::channel(request.id.clone());
        let admission = self.admit(request, completion);
        Submission { admission, ticket }
    }

    /// Submit a command and receive its result through `callback`, which
    /// runs on the resolving task and must not block.
    pub fn enqueue_with_callback<F>(&self, command: PumpCommand, source: CommandSource, callback: F) -> Admission
    where
        F: FnOnce(PumpEnactResult) + Send + 'static,
    {
        let request = CommandRequest::new(command, source);
        let completion = Completion::callback(request.id.clone(), callback);
        self.admit(request, completion)
    }

    fn admit(&self, request: CommandRequest, completion: Completion) -> Admission {
        if let Err(err) = request.command.validate(&self.inner.config.limits) {
            return self
                .inner
                .store
                .reject(request, completion, RejectReason::Invalid(err));
        }
        if request.kind().requires_running_pump() && self.inner.status.is_suspended() {
            return self
                .inner
                .store
                .reject(request, completion, RejectReason::PumpSuspended);
        }
        self.inner.store.add(request, completion)
    }

    pub fn read_status(&self, reason: impl Into<String>, source: CommandSource) -> Submission {
        self.enqueue(
            PumpCommand::ReadStatus {
                reason: reason.into(),
            },
            source,
        )
    }

    pub fn bolus(&self, insulin: f64, carbs: f64, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::Bolus(BolusRequest { insulin, carbs }), source)
    }

    pub fn smb(&self, insulin: f64, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::SmbBolus(BolusRequest::insulin(insulin)), source)
    }

    pub fn extended_bolus(&self, insulin: f64, duration_min: u32, source: CommandSource) -> Submission {
        self.enqueue(
            PumpCommand::ExtendedBolus {
                insulin,
                duration_min,
            },
            source,
        )
    }

    pub fn cancel_extended_bolus(&self, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::CancelExtendedBolus, source)
    }

    pub fn temp_basal_absolute(
        &self,
        rate: f64,
        duration_min: u32,
        enforce_new: bool,
        source: CommandSource,
    ) -> Submission {
        self.enqueue(
            PumpCommand::TempBasalAbsolute {
                rate,
                duration_min,
                enforce_new,
            },
            source,
        )
    }

    pub fn temp_basal_percent(
        &self,
        percent: u32,
        duration_min: u32,
        enforce_new: bool,
        source: CommandSource,
    ) -> Submission {
        self.enqueue(
            PumpCommand::TempBasalPercent {
                percent,
                duration_min,
                enforce_new,
            },
            source,
        )
    }

    pub fn cancel_temp_basal(&self, enforce_new: bool, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::CancelTempBasal { enforce_new }, source)
    }

    pub fn set_profile(&self, profile: BasalProfile, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::SetProfile(profile), source)
    }

    pub fn start_pump(&self, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::StartPump, source)
    }

    pub fn stop_pump(&self, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::StopPump, source)
    }

    pub fn load_history(&self, record_type: u8, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::LoadHistory { record_type }, source)
    }

    pub fn load_events(&self, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::LoadEvents, source)
    }

    pub fn load_tdds(&self, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::LoadTdds, source)
    }

    pub fn set_user_settings(&self, settings: BTreeMap<String, String>, source: CommandSource) -> Submission {
        self.enqueue(PumpCommand::SetUserSettings { settings }, source)
    }

    pub fn vendor_notification(&self, key: impl Into<String>, enabled: bool, source: CommandSource) -> Submission {
        self.enqueue(
            PumpCommand::VendorSpecificNotification {
                key: key.into(),
                enabled,
            },
            source,
        )
    }

    /// Turn a dosing recommendation into commands: the basal change first,
    /// then the SMB.
    pub fn apply_recommendation(&self, recommendation: &DosingRecommendation) -> Vec<Submission> {
        let source = CommandSource::Loop {
            reason: recommendation.reason.clone(),
        };
        let mut submissions = Vec::new();

        match recommendation.basal {
            BasalAction::Keep => {}
            BasalAction::SetTemp { rate, duration_min } => {
                submissions.push(self.temp_basal_absolute(rate, duration_min, false, source.clone()));
            }
            BasalAction::Cancel => {
                submissions.push(self.cancel_temp_basal(false, source.clone()));
            }
        }

        if let Some(units) = recommendation.smb_units.filter(|u| *u > 0.0) {
            submissions.push(self.smb(units, source));
        }

        tracing::debug!(
            commands = submissions.len(),
            reason = %recommendation.reason,
            "Applied dosing recommendation"
        );
        submissions
    }

    /// Connectivity with suspension overlaid.
    pub fn current_status(&self) -> ConnectivityState {
        self.inner.status.state()
    }

    pub fn status(&self) -> PumpStatus {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PumpStatus> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> Arc<CommandEventBus> {
        self.inner.events.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Pending commands, excluding the one in flight.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.inner.store.is_pending(kind)
    }

    pub fn is_running(&self, kind: CommandKind) -> bool {
        self.inner.store.is_running(kind)
    }

    pub fn performing(&self) -> Option<CommandKind> {
        self.inner.store.performing()
    }

    pub fn peek_conflicts(&self, kind: CommandKind) -> Vec<CommandId> {
        self.inner.store.peek_conflicts(kind)
    }

    pub fn status_text(&self) -> String {
        self.inner.store.status_text()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.store.stats()
    }

    /// Cancel every pending command. The in-flight command completes.
    pub fn clear_all(&self, reason: &str) -> usize {
        self.inner.store.clear_all(reason)
    }

    /// Stop the queue: refuse new commands, cancel pending ones, let the
    /// in-flight command finish, then stop the executor and flush the
    /// audit trail. Returns the number of commands cancelled.
    pub async fn shutdown(&self, reason: &str) -> usize {
        tracing::info!(reason, "Shutting down pump command queue");

        self.inner.store.close();
        let cancelled = self.inner.store.clear_all(reason);
        self.inner.shutdown_tx.send_replace(true);

        let executor = self.inner.executor.lock().take();
        if let Some(handle) = executor {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue executor task failed");
            }
        }

        self.inner.dispatcher.close();
        let forwarder = self.inner.forwarder.lock().take();
        if let Some(handle) = forwarder {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Audit forwarder task failed");
            }
        }

        // Never started: flush what was recorded so far inline
        let audit_rx = self.inner.audit_rx.lock().take();
        if let Some(mut rx) = audit_rx {
            while let Ok(record) = rx.try_recv() {
                forward_record(record, self.inner.audit_sink.as_ref(), self.inner.notifier.as_ref()).await;
            }
        }

        tracing::info!(cancelled, "Pump command queue stopped");
        cancelled
    }
}
