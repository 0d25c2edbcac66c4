//! Loki push client with classified retry and two retry tiers.
//!
//! The client serialises a push request once and reuses the buffered bytes
//! across every attempt, so a retried request is byte-identical to the first
//! one. Failures are classified on the error type itself:
//!
//! - transport errors, HTTP 429, and 5xx are **retryable**
//! - any other non-2xx status is **terminal** and consumes no further
//!   attempts
//!
//! Regular pushes use the standard retry budget; critical pushes (invocation
//! tail, shutdown) use the higher one.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::http::get_client;
use crate::loki::types::PushRequest;

/// Errors from a Loki push.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("failed to serialize push request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to gzip push request: {0}")]
    Compress(#[source] std::io::Error),

    /// The HTTP round-trip itself failed (connect, timeout, ...).
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The sink answered 429 or 5xx.
    #[error("push failed with status {status}: {body}")]
    RetryableStatus { status: StatusCode, body: String },

    /// The sink answered a non-retryable status (4xx except 429).
    #[error("push rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("push cancelled")]
    Cancelled,

    #[error("push failed after {retries} retries: {source}")]
    RetriesExhausted {
        retries: usize,
        #[source]
        source: Box<PushError>,
    },
}

impl PushError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PushError::Transport(_) | PushError::RetryableStatus { .. }
        )
    }
}

/// HTTP client for the Loki push endpoint.
pub struct LokiClient {
    endpoint: String,
    http: reqwest::Client,
    username: String,
    password: String,
    api_key: String,
    tenant_id: String,
    enable_gzip: bool,
    compression_threshold: usize,
    max_retries: usize,
    critical_retries: usize,
}

impl LokiClient {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        LokiClient {
            endpoint: config.loki_endpoint.clone(),
            http: get_client(),
            username: config.loki_username.clone(),
            password: config.loki_password.clone(),
            api_key: config.loki_api_key.clone(),
            tenant_id: config.loki_tenant_id.clone(),
            enable_gzip: config.enable_gzip,
            compression_threshold: config.compression_threshold,
            max_retries: config.max_retries,
            critical_retries: config.critical_flush_retries,
        }
    }

    /// Pushes with the regular retry budget.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
    ) -> Result<(), PushError> {
        self.push_with_retries(cancel, request, self.max_retries)
            .await
    }

    /// Pushes with the critical retry budget.
    pub async fn push_critical(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
    ) -> Result<(), PushError> {
        self.push_with_retries(cancel, request, self.critical_retries)
            .await
    }

    async fn push_with_retries(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
        retries: usize,
    ) -> Result<(), PushError> {
        if request.is_empty() {
            return Ok(());
        }

        let json_body = serde_json::to_vec(request)?;
        // Serialize and compress once; every attempt reuses these bytes.
        let (body, content_encoding) =
            if self.enable_gzip && json_body.len() > self.compression_threshold {
                (gzip(&json_body).map_err(PushError::Compress)?, Some("gzip"))
            } else {
                (json_body, None)
            };

        let mut attempt = 0;
        loop {
            match self.do_push(&body, content_encoding).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if attempt >= retries {
                        return Err(PushError::RetriesExhausted {
                            retries,
                            source: Box::new(err),
                        });
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(100u64 * (1u64 << (attempt - 1)));
                    debug!("LOKI | Push attempt {attempt} failed ({err}), retrying in {backoff:?}");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PushError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn do_push(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
    ) -> Result<(), PushError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body.to_vec());

        if let Some(encoding) = content_encoding {
            request = request.header("Content-Encoding", encoding);
        }

        // Bearer wins over basic; no auth when neither is configured.
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        } else if !self.username.is_empty() && !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        if !self.tenant_id.is_empty() {
            request = request.header("X-Scope-OrgID", &self.tenant_id);
        }

        let response = request.send().await.map_err(PushError::Transport)?;
        let status = response.status();
        if status.is_success() {
            debug!("LOKI | Push succeeded with status {status}");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PushError::RetryableStatus { status, body });
        }
        Err(PushError::Rejected { status, body })
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
