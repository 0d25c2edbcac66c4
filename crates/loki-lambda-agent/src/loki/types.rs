//! Loki push API wire types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of a Loki `/loki/api/v1/push` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub streams: Vec<Stream>,
}

/// A single log stream: one label set plus time-ordered values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Stream labels. Sorted map, so serialisation order is stable.
    pub stream: BTreeMap<String, String>,
    /// `[nanosecond-timestamp-as-decimal-string, line]` pairs.
    pub values: Vec<[String; 2]>,
}

impl PushRequest {
    /// Creates a single-stream push request.
    #[must_use]
    pub fn new(labels: BTreeMap<String, String>, values: Vec<[String; 2]>) -> Self {
        PushRequest {
            streams: vec![Stream {
                stream: labels,
                values,
            }],
        }
    }

    /// True when there is nothing to ship: no streams, or only empty ones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.iter().all(|stream| stream.values.is_empty())
    }
}
