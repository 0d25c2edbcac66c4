//! HTTP client construction for the outbound sink path.
//!
//! One shared builder so every push to Loki gets the same per-attempt
//! timeout, connection pooling, and TCP keep-alive. The Extensions API
//! control client deliberately does NOT use this builder; its `/event/next`
//! long-poll must be allowed to block far longer than any sink request.

use std::time::Duration;

use tracing::error;

/// Fixed per-attempt timeout for sink requests.
pub const SINK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates the HTTP client used for Loki pushes.
///
/// Falls back to reqwest defaults if the configured builder fails, so a
/// degraded client never prevents the agent from starting.
#[must_use]
pub fn get_client() -> reqwest::Client {
    match build_client() {
        Ok(client) => client,
        Err(e) => {
            error!("HTTP | Failed to build sink client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(SINK_REQUEST_TIMEOUT)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
}
