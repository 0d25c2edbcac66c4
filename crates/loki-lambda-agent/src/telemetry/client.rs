//! Telemetry API subscription client.

use hyper::StatusCode;
use tracing::debug;

use crate::telemetry::events::{BufferingConfig, Destination, SubscribeRequest};

const TELEMETRY_API_VERSION: &str = "2022-07-01";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from the telemetry subscription call.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to send telemetry subscription: {0}")]
    Request(#[from] reqwest::Error),

    #[error("telemetry subscription rejected with status {0}")]
    Rejected(StatusCode),
}

/// Client for the Lambda Telemetry API subscription endpoint.
pub struct TelemetryClient {
    base_url: String,
    http: reqwest::Client,
    extension_id: String,
}

impl TelemetryClient {
    #[must_use]
    pub fn new(runtime_api: &str, extension_id: String) -> Self {
        TelemetryClient {
            base_url: format!("http://{runtime_api}/{TELEMETRY_API_VERSION}/telemetry"),
            http: reqwest::Client::new(),
            extension_id,
        }
    }

    /// Subscribes the receiver at `listener_uri` to platform, function, and
    /// extension telemetry.
    pub async fn subscribe(&self, listener_uri: &str) -> Result<(), SubscribeError> {
        let request = SubscribeRequest {
            schema_version: TELEMETRY_API_VERSION.to_string(),
            types: vec![
                "platform".to_string(),
                "function".to_string(),
                "extension".to_string(),
            ],
            buffering: BufferingConfig {
                max_items: 1000,
                max_bytes: 262_144,
                timeout_ms: 100,
            },
            destination: Destination {
                protocol: "HTTP".to_string(),
                uri: listener_uri.to_string(),
            },
        };

        let response = self
            .http
            .put(&self.base_url)
            .header(EXTENSION_ID_HEADER, &self.extension_id)
            .json(&request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(SubscribeError::Rejected(response.status()));
        }
        debug!("TELEMETRY | Subscribed listener {listener_uri}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_shape() {
        let client = TelemetryClient::new("127.0.0.1:9001", "ext-1".to_string());
        assert_eq!(
            client.base_url,
            "http://127.0.0.1:9001/2022-07-01/telemetry"
        );
    }
}
