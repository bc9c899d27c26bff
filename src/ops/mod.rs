//! Operations.
//!
//! - `telemetry` - Structured logging setup and runtime level changes

pub mod telemetry;

pub use telemetry::*;
