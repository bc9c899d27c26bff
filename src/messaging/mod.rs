//! Message handling infrastructure.
//!
//! - `destination` - Destination handles and the destination engine contracts
//! - `memory` - In-process destination engine
//! - `namespace` - Tenant namespace mapping
//! - `subscriptions` - Per-identity subscription controller
//! - `transactions` - Client transactions and the expiry sweep
//! - `will` - Last-will registry

pub mod destination;
pub mod memory;
pub mod namespace;
pub mod subscriptions;
pub mod transactions;
pub mod will;

pub use destination::*;
pub use memory::*;
pub use namespace::*;
pub use subscriptions::*;
pub use transactions::*;
pub use will::*;
