//! Configuration Module
//!
//! This module handles all configuration for the extension, parsed from
//! environment variables with sensible defaults.
//!
//! ## Edge Cases and Behaviors
//!
//! - **Unparsable values**: every numeric or boolean option silently falls
//!   back to its default when the environment value does not parse.
//! - **`LOKI_LABELS`**: a JSON object of user labels. A malformed value is
//!   logged and replaced by an empty map.
//! - **`SERVICE_NAME`**: when present, injected into the label map as
//!   `service_name`.
//! - **`LOKI_URL`**: the one required option. An empty value is reported by
//!   [`Config::validate`] and is fatal at startup.
//! - **`LOKI_MAX_BATCH_SIZE_BYTES = 0`**: disables byte-capped flushing.
//! - **`LOKI_MAX_LINE_SIZE = 0`**: disables long-line splitting.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use tracing::warn;

/// Errors surfaced while validating the loaded configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("LOKI_URL environment variable is required")]
    MissingEndpoint,
}

/// Runtime configuration for the extension, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Loki push endpoint (required).
    pub loki_endpoint: String,

    // Authentication. The bearer token wins over the basic pair.
    pub loki_username: String,
    pub loki_password: String,
    pub loki_api_key: String,
    pub loki_tenant_id: String,

    /// Maximum entries per push.
    pub batch_size: usize,
    /// Maximum bytes per push; 0 disables byte-capped flushing.
    pub max_batch_size_bytes: usize,
    /// Flush interval while an invocation is active.
    pub flush_interval_ms: u64,
    /// Multiplier applied to the flush interval while idle.
    pub idle_flush_multiplier: u32,

    /// Retry budget for regular pushes.
    pub max_retries: usize,
    /// Higher retry budget for critical pushes (runtimeDone, shutdown).
    pub critical_flush_retries: usize,
    /// Gzip payloads larger than the threshold.
    pub enable_gzip: bool,
    /// Only compress when the serialised payload exceeds this many bytes.
    pub compression_threshold: usize,

    /// Buffer capacity in entries.
    pub buffer_size: usize,
    /// Maximum bytes per log line before splitting; 0 disables splitting.
    pub max_line_size: usize,
    /// Embed the request id into shipped log lines.
    pub extract_request_id: bool,

    /// User-provided stream labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            loki_endpoint: String::new(),
            loki_username: String::new(),
            loki_password: String::new(),
            loki_api_key: String::new(),
            loki_tenant_id: String::new(),
            batch_size: 100,
            max_batch_size_bytes: 5 * 1024 * 1024,
            flush_interval_ms: 1000,
            idle_flush_multiplier: 3,
            max_retries: 3,
            critical_flush_retries: 5,
            enable_gzip: true,
            compression_threshold: 1024,
            buffer_size: 10_000,
            max_line_size: 204_800,
            extract_request_id: true,
            labels: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let mut labels = match env::var("LOKI_LABELS") {
            Ok(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
                Ok(labels) => labels,
                Err(e) => {
                    warn!("CONFIG | Ignoring malformed LOKI_LABELS: {e}");
                    BTreeMap::new()
                }
            },
            _ => BTreeMap::new(),
        };
        if let Ok(service_name) = env::var("SERVICE_NAME") {
            if !service_name.is_empty() {
                labels.insert("service_name".to_string(), service_name);
            }
        }

        Config {
            loki_endpoint: env::var("LOKI_URL").unwrap_or_default(),
            loki_username: env::var("LOKI_USERNAME").unwrap_or_default(),
            loki_password: env::var("LOKI_PASSWORD").unwrap_or_default(),
            loki_api_key: env::var("LOKI_API_KEY").unwrap_or_default(),
            loki_tenant_id: env::var("LOKI_TENANT_ID").unwrap_or_default(),
            batch_size: env_parse("LOKI_BATCH_SIZE", defaults.batch_size),
            max_batch_size_bytes: env_parse(
                "LOKI_MAX_BATCH_SIZE_BYTES",
                defaults.max_batch_size_bytes,
            ),
            flush_interval_ms: env_parse("LOKI_FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
            idle_flush_multiplier: env_parse(
                "LOKI_IDLE_FLUSH_MULTIPLIER",
                defaults.idle_flush_multiplier,
            ),
            max_retries: env_parse("LOKI_MAX_RETRIES", defaults.max_retries),
            critical_flush_retries: env_parse(
                "LOKI_CRITICAL_FLUSH_RETRIES",
                defaults.critical_flush_retries,
            ),
            enable_gzip: env_bool("LOKI_ENABLE_GZIP", defaults.enable_gzip),
            compression_threshold: env_parse(
                "LOKI_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            ),
            buffer_size: env_parse("BUFFER_SIZE", defaults.buffer_size),
            max_line_size: env_parse("LOKI_MAX_LINE_SIZE", defaults.max_line_size),
            extract_request_id: env_bool("LOKI_EXTRACT_REQUEST_ID", defaults.extract_request_id),
            labels,
        }
    }

    /// Checks the invariants that cannot be defaulted away.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loki_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => match raw.trim() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => true,
            "0" | "f" | "F" | "false" | "FALSE" | "False" => false,
            _ => default,
        },
        _ => default,
    }
}
