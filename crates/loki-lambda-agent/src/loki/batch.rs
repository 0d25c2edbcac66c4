//! Assembly of buffered entries into a Loki push request.
//!
//! All entries of a batch share one stream. The request id is embedded into
//! the message content rather than promoted to a label: per-request labels
//! would explode stream cardinality in Loki, while an in-message field stays
//! searchable through LogQL content filters.

use std::collections::BTreeMap;

use crate::buffer::LogEntry;
use crate::loki::types::PushRequest;

/// Collects log entries for a single push request.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<LogEntry>,
    labels: BTreeMap<String, String>,
    inject_request_id: bool,
}

impl Batch {
    /// Creates an empty batch with the given stream labels. When
    /// `inject_request_id` is set, each entry's request id is embedded into
    /// its line.
    #[must_use]
    pub fn new(labels: BTreeMap<String, String>, inject_request_id: bool) -> Self {
        Batch {
            entries: Vec::new(),
            labels,
            inject_request_id,
        }
    }

    /// Appends entries, preserving their order.
    pub fn add(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts the batch into a push request, or `None` when empty.
    ///
    /// Entry timestamps are carried as milliseconds through the pipeline and
    /// become nanosecond decimal strings only here.
    #[must_use]
    pub fn into_push_request(self) -> Option<PushRequest> {
        if self.entries.is_empty() {
            return None;
        }

        let inject = self.inject_request_id;
        let values = self
            .entries
            .into_iter()
            .map(|entry| {
                let ts_nanos = entry.timestamp * 1_000_000;
                let line = if inject {
                    inject_request_id(entry.message, &entry.request_id)
                } else {
                    entry.message
                };
                [ts_nanos.to_string(), line]
            })
            .collect();

        Some(PushRequest::new(self.labels, values))
    }
}

/// Embeds the request id into a log line.
///
/// JSON lines get a `"request_id"` field right after the opening brace (no
/// trailing comma for an empty object body); plain text gets a
/// `[request_id=<id>] ` prefix. An empty id leaves the line unchanged.
fn inject_request_id(message: String, request_id: &str) -> String {
    if request_id.is_empty() {
        return message;
    }

    if message.trim_start().starts_with('{') {
        if let Some(idx) = message.find('{') {
            let (head, rest) = message.split_at(idx + 1);
            if rest.trim_start().starts_with('}') {
                return format!("{head}\"request_id\":\"{request_id}\"{rest}");
            }
            return format!("{head}\"request_id\":\"{request_id}\",{rest}");
        }
    }

    format!("[request_id={request_id}] {message}")
}
