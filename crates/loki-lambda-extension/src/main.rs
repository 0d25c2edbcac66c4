//! Process bootstrap for the Loki Lambda extension.
//!
//! Thin wrapper only: logging, configuration, signal wiring, and the
//! lifecycle manager. Exit code 0 on orderly shutdown; non-zero for missing
//! required configuration or an unrecoverable registration failure.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::env;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use loki_lambda_agent::config::Config;
use loki_lambda_agent::extension::lifecycle::{LifecycleError, Manager, TELEMETRY_SERVER_PORT};
use loki_lambda_agent::{log_build_info, logger};

#[tokio::main]
async fn main() {
    let log_level = env::var("LOKI_EXTENSION_LOG_LEVEL")
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    logger::init(&log_level);
    log_build_info();

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!("MAIN | {e}");
        std::process::exit(1);
    }

    let runtime_api = env::var("AWS_LAMBDA_RUNTIME_API").unwrap_or_default();
    if runtime_api.is_empty() {
        error!("MAIN | AWS_LAMBDA_RUNTIME_API is not set; not running under Lambda?");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let manager = Manager::new(Arc::new(config), runtime_api, TELEMETRY_SERVER_PORT);
    match manager.run(cancel).await {
        Ok(()) => {}
        Err(LifecycleError::Cancelled) => info!("MAIN | Cancelled, exiting"),
        Err(e) => {
            error!("MAIN | Extension error: {e}");
            std::process::exit(1);
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("MAIN | Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("MAIN | Received SIGTERM"),
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("MAIN | Received SIGINT");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("MAIN | Received SIGINT");
            }
        }
        cancel.cancel();
    });
}
