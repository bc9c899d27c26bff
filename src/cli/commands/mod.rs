//! CLI command implementations.

mod config;
mod inspect;
mod start;

pub use config::run_config;
pub use inspect::run_inspect;
pub use start::run_start;
