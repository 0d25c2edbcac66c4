//! # Loki Lambda Agent
//!
//! Core pipeline of an AWS Lambda external extension that captures the
//! function's telemetry feed and ships it to Grafana Loki.
//!
//! ## Overview
//!
//! Data flows host → receiver → buffer → coordinator → Loki:
//! - [`telemetry`]: Telemetry API subscription and the local receiver that
//!   normalises platform/function/extension events into log entries
//! - [`buffer`]: bounded FIFO with byte accounting shared by all producers
//! - [`extension`]: Extensions API control client and the lifecycle
//!   coordinator (adaptive flush loop, critical flush, invocation barrier)
//! - [`loki`]: bundle assembly and the push client with classified retries
//! - [`config`], [`logger`], [`http`]: environment configuration, the
//!   agent's own diagnostics (mirrored into the buffer), shared HTTP client
//!
//! ## Durability model
//!
//! Capture is in-memory and best-effort: capacity overflow drops the oldest
//! entries, delivery is at-least-once per attempt, and the critical flush
//! at each invocation's end ships everything captured for that invocation
//! before the host proceeds.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

/// Bounded in-memory buffer of captured log entries.
pub mod buffer;

/// Configuration from environment variables.
pub mod config;

/// Extensions API client and lifecycle coordination.
pub mod extension;

/// Outbound HTTP client construction.
pub mod http;

/// The agent's own diagnostics: stdout formatting and buffer mirroring.
pub mod logger;

/// Loki wire types, bundle assembly, and push client.
pub mod loki;

/// Telemetry API subscription and the local receiver.
pub mod telemetry;

/// Extension version advertised in diagnostics.
pub const EXTENSION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the extension version at startup.
pub fn log_build_info() {
    tracing::info!("loki-lambda-extension version {EXTENSION_VERSION}");
}
