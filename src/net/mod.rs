//! Adapter-facing contracts.
//!
//! - `security` - Security manager and per-session security context
//! - `connection` - Transport handle used for keep-alive supervision

pub mod connection;
pub mod security;

pub use connection::*;
pub use security::*;
