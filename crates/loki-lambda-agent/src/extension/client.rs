//! Lambda Extensions API control client.

use hyper::StatusCode;
use serde_json::json;

use crate::extension::events::{NextEventResponse, RegisterResponse};

const EXTENSION_API_VERSION: &str = "2020-01-01";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from the Extensions API.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    #[error("extension API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{endpoint} failed with status {status}")]
    Rejected {
        endpoint: &'static str,
        status: StatusCode,
    },

    #[error("register response is missing the extension identifier header")]
    MissingExtensionId,
}

/// Control client: registration plus the next-event long poll.
pub struct ExtensionClient {
    base_url: String,
    http: reqwest::Client,
    extension_id: String,
    extension_name: String,
}

impl ExtensionClient {
    /// `runtime_api` is the `host:port` from `AWS_LAMBDA_RUNTIME_API`.
    ///
    /// Uses a dedicated client without a request timeout: `/event/next`
    /// legitimately blocks until the next invocation.
    #[must_use]
    pub fn new(runtime_api: &str) -> Self {
        let extension_name = std::env::args()
            .next()
            .and_then(|arg0| {
                std::path::Path::new(&arg0)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "loki-lambda-extension".to_string());

        ExtensionClient {
            base_url: format!("http://{runtime_api}/{EXTENSION_API_VERSION}/extension"),
            http: reqwest::Client::new(),
            extension_id: String::new(),
            extension_name,
        }
    }

    /// Registers for INVOKE and SHUTDOWN events and records the extension
    /// identifier for subsequent calls.
    pub async fn register(&mut self) -> Result<RegisterResponse, ExtensionApiError> {
        let body = json!({ "events": ["INVOKE", "SHUTDOWN"] });

        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .header("Content-Type", "application/json")
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ExtensionApiError::Rejected {
                endpoint: "register",
                status: response.status(),
            });
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if extension_id.is_empty() {
            return Err(ExtensionApiError::MissingExtensionId);
        }
        self.extension_id = extension_id;

        Ok(response.json::<RegisterResponse>().await?)
    }

    /// Blocks until the host dispatches the next INVOKE or SHUTDOWN event.
    pub async fn next_event(&self) -> Result<NextEventResponse, ExtensionApiError> {
        let response = self
            .http
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, &self.extension_id)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ExtensionApiError::Rejected {
                endpoint: "next-event",
                status: response.status(),
            });
        }

        Ok(response.json::<NextEventResponse>().await?)
    }

    #[must_use]
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }
}
