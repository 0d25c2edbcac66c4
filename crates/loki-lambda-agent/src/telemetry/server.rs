//! Local HTTP receiver for the Lambda telemetry feed.
//!
//! The platform POSTs batched telemetry to this endpoint. Each batch is
//! turned into buffer entries in one pass:
//!
//! ```text
//!   POST / (JSON array)
//!        │
//!        v
//!   ┌────────────┐   platform.start / runtimeDone / report
//!   │  Classify  │──────────────────────────────────────────┐
//!   └─────┬──────┘                                          │
//!         │ function / extension                            │
//!         v                                                 v
//!   ┌────────────┐    ┌───────────┐    ┌──────────┐   ┌───────────┐
//!   │ Normalise  │──> │  Dedup    │──> │  Split   │   │  Format   │
//!   │ (ts prefix)│    │ (own logs)│    │ (chunks) │   │ (START /  │
//!   └────────────┘    └───────────┘    └────┬─────┘   │  REPORT)  │
//!                                           │         └─────┬─────┘
//!                                           v               │
//!                                   ┌───────────────┐       │
//!                                   │   AddBatch    │<──────┘
//!                                   └───────┬───────┘
//!                                           v
//!                              runtime-done callback (after enqueue)
//! ```
//!
//! The runtime-done callback fires strictly after the batch has been
//! enqueued, so every entry of the closing batch is visible to the
//! coordinator before the critical flush starts.

use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use regex::Regex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::buffer::{EntryKind, LogBuffer, LogEntry};
use crate::logger::SELF_LOG_MARKER;
use crate::telemetry::events::{
    RecordPayload, TelemetryEvent, EVENT_EXTENSION, EVENT_FUNCTION, EVENT_PLATFORM_REPORT,
    EVENT_PLATFORM_RUNTIME_DONE, EVENT_PLATFORM_START,
};

static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RequestId:\s*([a-f0-9-]+)").expect("request id pattern is valid")
});

/// Callback invoked with the request id from `platform.runtimeDone`, after
/// the batch containing it has been enqueued.
pub type RuntimeDoneHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Telemetry receiver, bound and served via [`TelemetryServer::start`].
pub struct TelemetryServer {
    state: TelemetryState,
    port: u16,
}

#[derive(Clone)]
struct TelemetryState {
    buffer: Arc<LogBuffer>,
    max_line_size: usize,
    extract_request_id: bool,
    current_request_id: Arc<RwLock<String>>,
    on_runtime_done: Option<RuntimeDoneHandler>,
}

impl TelemetryServer {
    #[must_use]
    pub fn new(
        buffer: Arc<LogBuffer>,
        port: u16,
        max_line_size: usize,
        extract_request_id: bool,
        on_runtime_done: Option<RuntimeDoneHandler>,
    ) -> Self {
        TelemetryServer {
            state: TelemetryState {
                buffer,
                max_line_size,
                extract_request_id,
                current_request_id: Arc::new(RwLock::new(String::new())),
                on_runtime_done,
            },
            port,
        }
    }

    /// Binds the listener and serves in a background task until the token is
    /// cancelled. Pass port 0 for an OS-assigned port (tests).
    pub async fn start(
        self,
        cancel: CancellationToken,
    ) -> Result<RunningTelemetryServer, std::io::Error> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        let port = listener.local_addr()?.port();

        let router = Router::new()
            .route("/", post(handle_telemetry))
            .fallback(handler_not_found)
            .with_state(self.state);

        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!("TELEMETRY | Receiver error: {e}");
            }
        });

        Ok(RunningTelemetryServer { port, cancel, task })
    }
}

/// Handle to a started receiver.
pub struct RunningTelemetryServer {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningTelemetryServer {
    /// URI the Telemetry API subscription points at.
    #[must_use]
    pub fn listener_uri(&self) -> String {
        format!("http://sandbox.localdomain:{}", self.port)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting connections and waits up to `grace` for in-flight
    /// requests, then aborts.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("TELEMETRY | Receiver did not stop within {grace:?}, aborting");
            task.abort();
        }
    }
}

async fn handler_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

async fn handle_telemetry(State(state): State<TelemetryState>, body: Bytes) -> StatusCode {
    let events: Vec<TelemetryEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!("TELEMETRY | Failed to parse telemetry events: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let (entries, runtime_done_request_id) = state.process_events(events);

    if !entries.is_empty() {
        state.buffer.add_batch(entries);
    }

    // Strictly after the enqueue, so the closing batch is visible to the
    // critical flush.
    if let Some(request_id) = runtime_done_request_id {
        if let Some(handler) = &state.on_runtime_done {
            handler(request_id);
        }
    }

    StatusCode::OK
}

impl TelemetryState {
    fn current_request_id(&self) -> String {
        self.current_request_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_request_id(&self, request_id: String) {
        *self
            .current_request_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = request_id;
    }

    /// Turns one telemetry batch into buffer entries, preserving input
    /// order, and surfaces the runtimeDone request id when present.
    fn process_events(&self, events: Vec<TelemetryEvent>) -> (Vec<LogEntry>, Option<String>) {
        let mut entries = Vec::with_capacity(events.len());
        let mut runtime_done_request_id = None;

        for event in events {
            match event.event_type.as_str() {
                EVENT_PLATFORM_START => {
                    if let Some(request_id) = record_string_field(&event.record, "requestId") {
                        self.set_current_request_id(request_id);
                    }
                    entries.push(LogEntry {
                        timestamp: parse_timestamp_ms(&event.time),
                        message: format_platform_start(&event.record),
                        kind: EntryKind::Platform,
                        request_id: self.current_request_id(),
                    });
                }

                EVENT_PLATFORM_RUNTIME_DONE => {
                    if let Some(request_id) = record_string_field(&event.record, "requestId") {
                        runtime_done_request_id = Some(request_id);
                    }
                    entries.push(LogEntry {
                        timestamp: parse_timestamp_ms(&event.time),
                        message: record_to_json(&event.record),
                        kind: EntryKind::Platform,
                        request_id: self.current_request_id(),
                    });
                }

                EVENT_PLATFORM_REPORT => {
                    entries.push(LogEntry {
                        timestamp: parse_timestamp_ms(&event.time),
                        message: format_platform_report(&event.record),
                        kind: EntryKind::Platform,
                        request_id: self.current_request_id(),
                    });
                }

                EVENT_FUNCTION | EVENT_EXTENSION => {
                    let kind = if event.event_type == EVENT_FUNCTION {
                        EntryKind::Function
                    } else {
                        EntryKind::Extension
                    };
                    let (message, timestamp) = normalize_record(&event.record, &event.time);

                    // Our own diagnostics reach the buffer through the logger
                    // mirror; the telemetry echo must not double-count them.
                    if kind == EntryKind::Extension && message.contains(SELF_LOG_MARKER) {
                        continue;
                    }

                    let mut request_id = self.current_request_id();
                    if request_id.is_empty() && self.extract_request_id {
                        request_id = extract_request_id(&message).unwrap_or_default();
                    }

                    if self.max_line_size > 0 && message.len() > self.max_line_size {
                        for (i, chunk) in
                            split_message(&message, self.max_line_size).into_iter().enumerate()
                        {
                            entries.push(LogEntry {
                                timestamp: timestamp + i as i64,
                                message: chunk,
                                kind,
                                request_id: request_id.clone(),
                            });
                        }
                    } else {
                        entries.push(LogEntry {
                            timestamp,
                            message,
                            kind,
                            request_id,
                        });
                    }
                }

                _ => {}
            }
        }

        (entries, runtime_done_request_id)
    }
}

/// Parses an RFC3339(-nanos) timestamp into epoch milliseconds, or `None`.
fn try_parse_timestamp_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.timestamp_millis())
}

fn parse_timestamp_ms(raw: &str) -> i64 {
    try_parse_timestamp_ms(raw).unwrap_or_else(|| Utc::now().timestamp_millis())
}

fn record_string_field(record: &RecordPayload, field: &str) -> Option<String> {
    match record {
        RecordPayload::Structured(Value::Object(map)) => map
            .get(field)
            .and_then(Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

/// JSON-encodes a record the way the platform would print it; a text record
/// becomes a JSON string.
fn record_to_json(record: &RecordPayload) -> String {
    match record {
        RecordPayload::Text(text) => {
            serde_json::to_string(text).unwrap_or_else(|_| text.clone())
        }
        RecordPayload::Structured(value) => value.to_string(),
    }
}

/// Formats `platform.start` as the familiar `START RequestId: ...` line,
/// falling back to the JSON record when fields are missing.
fn format_platform_start(record: &RecordPayload) -> String {
    let request_id = record_string_field(record, "requestId").unwrap_or_default();
    let version = record_string_field(record, "version").unwrap_or_default();
    if !request_id.is_empty() && !version.is_empty() {
        format!("START RequestId: {request_id} Version: {version}")
    } else {
        record_to_json(record)
    }
}

/// Formats `platform.report` as the tab-separated `REPORT ...` line,
/// falling back to the JSON record when fields are missing.
fn format_platform_report(record: &RecordPayload) -> String {
    let RecordPayload::Structured(Value::Object(map)) = record else {
        return record_to_json(record);
    };
    let request_id = map.get("requestId").and_then(Value::as_str).unwrap_or("");
    let Some(Value::Object(metrics)) = map.get("metrics") else {
        return record_to_json(record);
    };
    if request_id.is_empty() {
        return record_to_json(record);
    }

    let metric = |name: &str| metrics.get(name).and_then(Value::as_f64).unwrap_or(0.0);
    let mut message = format!(
        "REPORT RequestId: {request_id}\tDuration: {:.2} ms\tBilled Duration: {:.0} ms\tMemory Size: {:.0} MB\tMax Memory Used: {:.0} MB",
        metric("durationMs"),
        metric("billedDurationMs"),
        metric("memorySizeMB"),
        metric("maxMemoryUsedMB"),
    );
    let init_duration = metric("initDurationMs");
    if init_duration > 0.0 {
        message.push_str(&format!("\tInit Duration: {init_duration:.2} ms"));
    }
    message
}

/// Normalises a function/extension record into `(message, timestamp_ms)`.
///
/// Runtime log lines often carry a `<RFC3339>\t<level>\t<body>` prefix in
/// front of a structured body. The prefix is stripped only when a `{` or `[`
/// delimiter actually appears past position 0, and its timestamp replaces
/// the outer event time only when it parses.
fn normalize_record(record: &RecordPayload, fallback_time: &str) -> (String, i64) {
    let message = match record {
        RecordPayload::Text(text) => text.clone(),
        RecordPayload::Structured(value) => value.to_string(),
    };

    if let Some(idx) = message
        .find(|c| c == '{' || c == '[')
        .filter(|idx| *idx > 0)
    {
        let prefix = &message[..idx];
        let body = message[idx..].trim().to_string();
        if let Some(tab) = prefix.find('\t') {
            if let Some(ts) = try_parse_timestamp_ms(&prefix[..tab]) {
                return (body, ts);
            }
        }
        return (body, parse_timestamp_ms(fallback_time));
    }

    (message.trim().to_string(), parse_timestamp_ms(fallback_time))
}

/// Extracts a request id from a log line via the `RequestId: <hex>` form.
fn extract_request_id(message: &str) -> Option<String> {
    REQUEST_ID_RE
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Splits an oversized message into `[chunk i/N] `-prefixed chunks.
///
/// The effective chunk size reserves room for the marker and never drops
/// below 100 bytes; chunk boundaries are pulled back to char boundaries so
/// multi-byte content stays valid UTF-8.
fn split_message(message: &str, max_size: usize) -> Vec<String> {
    if message.len() <= max_size {
        return vec![message.to_string()];
    }

    let effective_size = max_size.saturating_sub(20).max(100);

    let mut parts = Vec::with_capacity(message.len().div_ceil(effective_size));
    let mut start = 0;
    while start < message.len() {
        let mut end = (start + effective_size).min(message.len());
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        parts.push(&message[start..end]);
        start = end;
    }

    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| format!("[chunk {}/{}] {}", i + 1, total, part))
        .collect()
}
