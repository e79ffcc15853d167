//! Result delivery.
//!
//! Each caller holds a [`CommandTicket`] paired with a [`Completion`] that
//! travels with the command. A completion is consumed when it resolves,
//! and one that is dropped unresolved resolves itself as cancelled, so
//! every ticket yields exactly one result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::audit::{AuditRecord, AuditSink};
use crate::command::{CommandId, CommandRequest};
use crate::events::{CommandEvent, CommandEventBus};
use crate::notify::{Notifier, PumpAlert};
use crate::result::PumpEnactResult;

const DROPPED: &str = "command dropped before completion";

type Callback = Box<dyn FnOnce(PumpEnactResult) + Send + 'static>;

enum Responder {
    Channel(oneshot::Sender<PumpEnactResult>),
    Callback(Callback),
}

/// Single-use completion of one caller.
pub struct Completion {
    id: CommandId,
    responder: Option<Responder>,
}

impl Completion {
    /// Completion paired with a ticket the caller can await.
    pub fn channel(id: CommandId) -> (Completion, CommandTicket) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            id: id.clone(),
            responder: Some(Responder::Channel(tx)),
        };
        (completion, CommandTicket { id, rx })
    }

    /// Completion that invokes `callback` on the resolving task. The
    /// callback must not block.
    pub fn callback<F>(id: CommandId, callback: F) -> Completion
    where
        F: FnOnce(PumpEnactResult) + Send + 'static,
    {
        Completion {
            id,
            responder: Some(Responder::Callback(Box::new(callback))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver `result`. Returns false if the caller stopped listening.
    pub fn resolve(mut self, result: PumpEnactResult) -> bool {
        match self.responder.take() {
            Some(responder) => deliver(responder, result),
            None => false,
        }
    }
}

fn deliver(responder: Responder, result: PumpEnactResult) -> bool {
    match responder {
        Responder::Channel(tx) => tx.send(result).is_ok(),
        Responder::Callback(callback) => {
            callback(result);
            true
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            tracing::warn!(command_id = %self.id, "Completion dropped unresolved");
            deliver(responder, PumpEnactResult::cancelled(DROPPED));
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("resolved", &self.responder.is_none())
            .finish()
    }
}

/// Future of a command's result.
#[derive(Debug)]
pub struct CommandTicket {
    id: CommandId,
    rx: oneshot::Receiver<PumpEnactResult>,
}

impl CommandTicket {
    /// Id of the command this ticket belongs to. For a coalesced request
    /// this is the request's own id, not the id it was merged into.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The result, if it is already available.
    pub fn try_result(&mut self) -> Option<PumpEnactResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(PumpEnactResult::cancelled(DROPPED)),
        }
    }
}

impl Future for CommandTicket {
    type Output = PumpEnactResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(PumpEnactResult::cancelled(DROPPED)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves commands and fans results out to callers, the event bus and
/// the audit trail.
pub struct ResultDispatcher {
    events: Arc<CommandEventBus>,
    audit_tx: Mutex<Option<mpsc::UnboundedSender<AuditRecord>>>,
}

impl ResultDispatcher {
    pub fn new(events: Arc<CommandEventBus>) -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            events,
            audit_tx: Mutex::new(Some(tx)),
        };
        (dispatcher, rx)
    }

    /// Resolve every waiter of `request` with `result`. Never blocks.
    pub fn resolve(&self, request: &CommandRequest, waiters: Vec<Completion>, result: PumpEnactResult) {
        let callers = waiters.len();
        let mut delivered = 0;
        for waiter in waiters {
            if waiter.resolve(result.clone()) {
                delivered += 1;
            }
        }

        tracing::debug!(
            command_id = %request.id,
            kind = %request.kind(),
            code = result.code(),
            callers,
            delivered,
            "Command resolved"
        );

        self.events.publish(
            CommandEvent::new(CommandEvent::terminal_type(&result), request.id.clone(), request.kind())
                .with_result(result.clone()),
        );

        if let Some(tx) = self.audit_tx.lock().as_ref() {
            if tx.send(AuditRecord::new(request, callers, result)).is_err() {
                tracing::warn!(command_id = %request.id, "Audit forwarder gone, record dropped");
            }
        }
    }

    /// Stop forwarding audit records; the forwarder drains and exits.
    pub fn close(&self) {
        self.audit_tx.lock().take();
    }
}

/// Hand one record to the notifier (if it needs attention) and the sink.
pub async fn forward_record(record: AuditRecord, sink: &dyn AuditSink, notifier: &dyn Notifier) {
    if let Some(alert) = PumpAlert::from_record(&record) {
        notifier.notify(alert).await;
    }
    sink.record(record).await;
}

/// Forward audit records on their own task until the dispatcher closes.
pub fn spawn_audit_forwarder(
    mut rx: mpsc::UnboundedReceiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            forward_record(record, sink.as_ref(), notifier.as_ref()).await;
        }
        tracing::debug!("Audit forwarder stopped");
    })
}
