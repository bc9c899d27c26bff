//! Core infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `time` - Clock abstraction and cancellable timers

pub mod config;
pub mod time;

pub use config::*;
pub use time::*;
