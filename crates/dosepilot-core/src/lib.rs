//! Core types for dosepilot.
//!
//! Configuration, the shared error type, therapy data and the dosing
//! engine interface used by the pump command queue.

pub mod config;
pub mod dosing;
pub mod error;
pub mod therapy;

pub use config::{DisconnectPolicy, PumpLimits, QueueConfig, RetryPolicy};
pub use dosing::{BasalAction, DosingEngine, DosingRecommendation};
pub use error::{Error, Result};
pub use therapy::{BasalProfile, BasalSegment, GlucoseReading, Trend};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
