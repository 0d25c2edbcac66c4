//! Wire types for the Lambda Telemetry API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Platform events.
pub const EVENT_PLATFORM_START: &str = "platform.start";
pub const EVENT_PLATFORM_RUNTIME_DONE: &str = "platform.runtimeDone";
pub const EVENT_PLATFORM_REPORT: &str = "platform.report";

// Log line events.
pub const EVENT_FUNCTION: &str = "function";
pub const EVENT_EXTENSION: &str = "extension";

/// One record of the telemetry feed.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryEvent {
    /// RFC3339 timestamp with nanosecond precision.
    pub time: String,
    /// Event type, e.g. `platform.start` or `function`. Open-ended; unknown
    /// types are ignored by the receiver.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload, either a raw log line or a structured record.
    pub record: RecordPayload,
}

/// The telemetry `record` field: the platform sends a plain string for log
/// lines and a JSON object for platform events.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecordPayload {
    Text(String),
    Structured(Value),
}

/// Subscription request body for the Telemetry API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub schema_version: String,
    pub types: Vec<String>,
    pub buffering: BufferingConfig,
    pub destination: Destination,
}

/// Platform-side buffering knobs for the telemetry feed.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    pub max_items: u32,
    pub max_bytes: u32,
    pub timeout_ms: u32,
}

/// Where the platform delivers the feed.
#[derive(Debug, Clone, Serialize)]
pub struct Destination {
    pub protocol: String,
    #[serde(rename = "URI")]
    pub uri: String,
}
