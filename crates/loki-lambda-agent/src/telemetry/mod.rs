//! Lambda Telemetry API integration.
//!
//! Three pieces:
//! - [`events`]: wire types for the telemetry feed and the subscription call
//! - [`server`]: the local HTTP receiver the platform pushes batches to
//! - [`client`]: the subscription client that points the platform at the
//!   receiver

pub mod client;
pub mod events;
pub mod server;

pub use client::TelemetryClient;
pub use server::{RunningTelemetryServer, RuntimeDoneHandler, TelemetryServer};
