//! Loki push path: wire types, bundle assembly, and the HTTP client.

pub mod batch;
pub mod client;
pub mod types;

pub use batch::Batch;
pub use client::{LokiClient, PushError};
pub use types::{PushRequest, Stream};
