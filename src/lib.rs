#![warn(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: durations reported as integer millis
#![allow(clippy::cast_possible_truncation)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Debug impl completeness
#![allow(clippy::missing_fields_in_debug)]
// Error handling style
#![allow(clippy::result_large_err)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Session and subscription lifecycle engine for a multi-protocol broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Clock abstraction and cancellable timers
//!
//! ## Sessions
//! - `session` - Session contexts and live sessions
//! - `session::manager` - Pipeline lock domains and lifecycle transitions
//!
//! ## Messaging
//! - `messaging::destination` - Destination engine contracts
//! - `messaging::memory` - In-process destination engine
//! - `messaging::namespace` - Tenant namespace mapping
//! - `messaging::subscriptions` - Subscription controller
//! - `messaging::transactions` - Transactions and expiry sweep
//! - `messaging::will` - Last-will registry
//!
//! ## Networking
//! - `net::security` - Security manager and per-session security context
//! - `net::connection` - Transport handle contract
//!
//! ## Storage
//! - `storage` - Durable session and will state
//!
//! ## Operations
//! - `ops::telemetry` - Structured logging

// Core infrastructure
pub mod core;

// Sessions
pub mod session;

// Messaging
pub mod messaging;

// Networking
pub mod net;

// Storage
pub mod storage;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, time};
pub use messaging::{destination, namespace, subscriptions, transactions, will};
pub use net::{connection, security};
pub use ops::telemetry;
pub use session::manager::SessionManager;
