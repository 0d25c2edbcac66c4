//! Wire types for the Lambda Extensions API.

use serde::Deserialize;

/// Host control events the extension registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ExtensionEventType {
    #[serde(rename = "INVOKE")]
    Invoke,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

/// Response from extension registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub function_name: String,
    pub function_version: String,
    #[serde(default)]
    pub handler: String,
}

/// Response from the next-event long poll.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: ExtensionEventType,
    #[serde(default)]
    pub deadline_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub tracing: Option<Tracing>,
    #[serde(default)]
    pub shutdown_reason: String,
}

/// X-Ray tracing information attached to an INVOKE event.
#[derive(Debug, Clone, Deserialize)]
pub struct Tracing {
    #[serde(rename = "type")]
    pub tracing_type: String,
    pub value: String,
}
