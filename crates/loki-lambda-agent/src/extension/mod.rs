//! Lambda Extensions API integration and the extension lifecycle.
//!
//! - [`events`]: register/next-event wire types
//! - [`client`]: the control client (register, long-poll next event)
//! - [`lifecycle`]: the coordinator driving capture, flush, and shutdown

pub mod client;
pub mod events;
pub mod lifecycle;

pub use client::ExtensionClient;
pub use lifecycle::{ExtensionState, FlushCoordinator, LifecycleError, Manager};
