//! Testing utilities for dosepilot
//!
//! This crate provides testing tools including:
//! - A simulated pump driver with scripted and random faults
//! - Glucose trace generators
//! - A reference dosing engine

pub mod dosing;
pub mod simulated_pump;
pub mod test_data;

pub use dosing::TargetDosingEngine;
pub use simulated_pump::{ConnectFault, ExecuteFault, ExecutionRecord, PumpState, SimulatedPump};
pub use test_data::{DataPattern, GlucoseScenario, TestDataGenerator};
