//! Pump command queue.
//!
//! Provides:
//! - Command data structures and validation
//! - Priority queue store with merge and supersede rules
//! - A single executor that owns the pump link
//! - Post-failure reconciliation of dose-affecting commands
//! - Status tracking, result dispatch, audit and alerting
//! - Command lifecycle events

pub mod api;
pub mod audit;
pub mod command;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod events;
pub mod notify;
mod processor;
pub mod queue;
pub mod reconcile;
pub mod result;
pub mod status;

// Re-exports
pub use command::{
    BolusRequest, CommandId, CommandKind, CommandPriority, CommandRequest, CommandSource,
    ConflictClass, MergeRule, PumpCommand,
};

pub use error::{CommandError, RejectReason, ValidationError};

pub use result::PumpEnactResult;

pub use driver::{
    ActiveExtendedBolus, ActiveTempBasal, BolusRecord, DeviceResponse, DriverError, Observed,
    PumpDriver, PumpSnapshot,
};

pub use queue::{Admission, QueueStats, QueueStore};

pub use status::{ConnectivityState, ExecutorState, PumpStatus, StatusTracker};

pub use dispatcher::{CommandTicket, Completion};

pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};

pub use notify::{AlertSeverity, LogNotifier, MemoryNotifier, Notifier, PumpAlert};

pub use events::{CommandEvent, CommandEventBus, CommandEventType, EventFilter, FilteredSubscriber};

pub use api::{PumpCommandQueue, PumpCommandQueueBuilder, QueueError, Submission};
