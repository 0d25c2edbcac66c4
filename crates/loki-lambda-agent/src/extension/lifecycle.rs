//! Extension lifecycle: state machine, flush loop, and invocation barrier.
//!
//! # Architecture
//!
//! ```text
//!   Extensions API           Telemetry API
//!   (INVOKE/SHUTDOWN)        (event batches)
//!         │                        │
//!         v                        v
//!   ┌───────────┐   ┌──────────────────────┐
//!   │  Manager  │   │  TelemetryServer     │
//!   │ event loop│   │  (receiver)          │
//!   └─────┬─────┘   └──────────┬───────────┘
//!         │ arm barrier        │ AddBatch + runtimeDone
//!         v                    v
//!   ┌─────────────────────────────────────┐
//!   │          FlushCoordinator           │
//!   │  IDLE ──INVOKE──> ACTIVE            │
//!   │  ACTIVE ──runtimeDone──> FLUSHING   │
//!   │  FLUSHING ──flush done──> IDLE      │
//!   └──────────────────┬──────────────────┘
//!                      v
//!                 LokiClient
//! ```
//!
//! # Flush discipline
//!
//! One `tokio::sync::Mutex` serialises every flush, regular or critical,
//! across the whole process. The state cell only selects the flush interval;
//! it is never used for mutual exclusion.
//!
//! # Invocation barrier
//!
//! The event loop blocks after dispatching an INVOKE until the matching
//! runtimeDone critical flush completes. Each INVOKE arms a fresh oneshot
//! channel; reusing a slot across invocations would race against the
//! previous completion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{LogBuffer, LogEntry};
use crate::config::Config;
use crate::extension::client::{ExtensionApiError, ExtensionClient};
use crate::extension::events::{ExtensionEventType, RegisterResponse};
use crate::loki::batch::Batch;
use crate::loki::client::{LokiClient, PushError};
use crate::loki::types::PushRequest;
use crate::telemetry::client::{SubscribeError, TelemetryClient};
use crate::telemetry::server::{RuntimeDoneHandler, TelemetryServer};
use crate::{logger, telemetry};

/// Port the telemetry receiver binds in production.
pub const TELEMETRY_SERVER_PORT: u16 = 8080;

const RECEIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const TRAILING_TELEMETRY_GRACE: Duration = Duration::from_millis(100);
const CRITICAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Operational state driving flush interval selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    /// No invocation in progress; long flush interval.
    Idle,
    /// Invocation in progress; base flush interval.
    Active,
    /// Critical flush in progress; slightly longer interval.
    Flushing,
}

impl ExtensionState {
    const fn as_u8(self) -> u8 {
        match self {
            ExtensionState::Idle => 0,
            ExtensionState::Active => 1,
            ExtensionState::Flushing => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExtensionState::Active,
            2 => ExtensionState::Flushing,
            _ => ExtensionState::Idle,
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtensionState::Idle => "IDLE",
            ExtensionState::Active => "ACTIVE",
            ExtensionState::Flushing => "FLUSHING",
        })
    }
}

/// Errors that abort the lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    ExtensionApi(#[from] ExtensionApiError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("failed to start telemetry receiver: {0}")]
    Receiver(#[from] std::io::Error),

    #[error("lifecycle cancelled")]
    Cancelled,
}

/// Drives flush policy across the lifecycle: interval selection, the
/// at-most-one-flush gate, critical flushes, and the invocation barrier.
pub struct FlushCoordinator {
    config: Arc<Config>,
    buffer: Arc<LogBuffer>,
    client: LokiClient,
    labels: BTreeMap<String, String>,
    state: AtomicU8,
    interval_change: Notify,
    flush_gate: Mutex<()>,
    barrier: StdMutex<Option<oneshot::Sender<()>>>,
}

impl FlushCoordinator {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        buffer: Arc<LogBuffer>,
        client: LokiClient,
        labels: BTreeMap<String, String>,
    ) -> Self {
        FlushCoordinator {
            config,
            buffer,
            client,
            labels,
            state: AtomicU8::new(ExtensionState::Idle.as_u8()),
            interval_change: Notify::new(),
            flush_gate: Mutex::new(()),
            barrier: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ExtensionState {
        ExtensionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Updates the state and signals the flush loop on an actual change.
    pub fn set_state(&self, next: ExtensionState) {
        let prev = ExtensionState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst));
        if prev != next {
            debug!("LIFECYCLE | State transition: {prev} -> {next}");
            self.interval_change.notify_one();
        }
    }

    /// Flush interval for the current state.
    pub fn flush_interval(&self) -> Duration {
        let base = Duration::from_millis(self.config.flush_interval_ms);
        match self.state() {
            ExtensionState::Active => base,
            ExtensionState::Idle => base * self.config.idle_flush_multiplier,
            ExtensionState::Flushing => base * 3 / 2,
        }
    }

    /// Whether the buffer holds enough for an early (ready-signal) flush.
    pub fn should_flush(&self) -> bool {
        if self.buffer.len() >= self.config.batch_size {
            return true;
        }
        self.config.max_batch_size_bytes > 0
            && self.buffer.byte_size() >= self.config.max_batch_size_bytes
    }

    fn take_batch(&self) -> Vec<LogEntry> {
        if self.config.max_batch_size_bytes > 0 {
            self.buffer
                .flush_by_size(self.config.batch_size, self.config.max_batch_size_bytes)
        } else {
            self.buffer.flush(self.config.batch_size)
        }
    }

    fn build_push_request(&self, entries: Vec<LogEntry>) -> Option<PushRequest> {
        let mut batch = Batch::new(self.labels.clone(), self.config.extract_request_id);
        batch.add(entries);
        batch.into_push_request()
    }

    /// Background flush loop, active from init to shutdown.
    ///
    /// Waits on four sources: the interval timer, the buffer's ready signal,
    /// the interval-change edge, and cancellation. A ready edge only
    /// triggers a flush when [`FlushCoordinator::should_flush`] holds; a
    /// missed edge is recovered by the next timer tick.
    pub async fn run_flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = self.flush_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        debug!(
            "LIFECYCLE | Flush loop started with interval {interval:?} (state: {})",
            self.state()
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("LIFECYCLE | Flush loop stopping");
                    return;
                }
                () = self.interval_change.notified() => {
                    let next = self.flush_interval();
                    if next != interval {
                        interval = next;
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + interval,
                            interval,
                        );
                        debug!(
                            "LIFECYCLE | Flush interval adjusted to {interval:?} (state: {})",
                            self.state()
                        );
                    }
                }
                _ = ticker.tick() => {
                    self.flush_once(&cancel, false).await;
                }
                () = self.buffer.ready().notified() => {
                    if self.should_flush() {
                        self.flush_once(&cancel, false).await;
                    }
                }
            }
        }
    }

    /// Removes one batch from the buffer and pushes it; errors are logged
    /// and swallowed, the next tick retries with whatever the buffer then
    /// holds.
    pub async fn flush_once(&self, cancel: &CancellationToken, critical: bool) {
        let _gate = self.flush_gate.lock().await;

        let entries = self.take_batch();
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        let Some(request) = self.build_push_request(entries) else {
            return;
        };

        let result = if critical {
            self.client.push_critical(cancel, &request).await
        } else {
            self.client.push(cancel, &request).await
        };
        match result {
            Ok(()) => debug!("LIFECYCLE | Pushed {count} log entries"),
            Err(PushError::Cancelled) => debug!("LIFECYCLE | Push cancelled"),
            Err(e) => error!("LIFECYCLE | Failed to push logs: {e}"),
        }
    }

    /// RuntimeDone entry point: transitions to FLUSHING and runs the
    /// critical flush in a background task so the telemetry response is not
    /// held up. Completion (or the 10 s bound) releases the barrier.
    pub fn on_runtime_done(self: &Arc<Self>, request_id: String) {
        info!(
            "LIFECYCLE | Received runtimeDone for request {request_id}, starting critical flush (buffer: {} entries)",
            self.buffer.len()
        );
        self.set_state(ExtensionState::Flushing);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let bounded =
                tokio::time::timeout(CRITICAL_FLUSH_TIMEOUT, coordinator.critical_flush(&cancel));
            if bounded.await.is_err() {
                cancel.cancel();
                warn!("LIFECYCLE | Critical flush timed out after {CRITICAL_FLUSH_TIMEOUT:?}");
            }
            coordinator.set_state(ExtensionState::Idle);
            coordinator.release_barrier();
        });
    }

    /// Exhaustively flushes what the buffer held when the invocation ended.
    async fn critical_flush(&self, cancel: &CancellationToken) {
        // Snapshot before any of our own logging below; the logger mirrors
        // into this same buffer, so counting after logging never converges.
        let mut remaining = self.buffer.len();
        info!("LIFECYCLE | Critical flush starting (buffer: {remaining} entries)");

        let _gate = self.flush_gate.lock().await;
        while remaining > 0 {
            let entries = self.take_batch();
            if entries.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(entries.len());
            let count = entries.len();
            let Some(request) = self.build_push_request(entries) else {
                break;
            };
            match self.client.push_critical(cancel, &request).await {
                Ok(()) => debug!("LIFECYCLE | Critical flush pushed {count} entries"),
                Err(e) => {
                    // push_critical already retried internally; do not retry
                    // the same bundle here.
                    error!("LIFECYCLE | Critical flush push failed: {e}");
                    break;
                }
            }
        }
        info!("LIFECYCLE | Critical flush complete");
    }

    /// Arms a fresh completion barrier for the next invocation, replacing
    /// (and thereby releasing) any stale one.
    pub fn arm_barrier(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Releases the armed barrier, if any.
    pub fn release_barrier(&self) {
        let sender = self
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Shutdown tail: drains (and closes) the buffer, then pushes whatever
    /// was left in one critical push.
    pub async fn drain_and_push(&self, cancel: &CancellationToken) {
        let entries = self.buffer.drain();
        if entries.is_empty() {
            return;
        }
        info!(
            "LIFECYCLE | Flushing {} remaining log entries with critical retries",
            entries.len()
        );
        let Some(request) = self.build_push_request(entries) else {
            return;
        };
        if let Err(e) = self.client.push_critical(cancel, &request).await {
            error!("LIFECYCLE | Failed to push final logs: {e}");
        }
    }
}

/// Builds the stream label set: user labels first, auto-labels win.
fn build_labels(
    config: &Config,
    registration: &RegisterResponse,
    region: Option<String>,
) -> BTreeMap<String, String> {
    let mut labels = config.labels.clone();
    labels.insert(
        "function_name".to_string(),
        registration.function_name.clone(),
    );
    labels.insert(
        "function_version".to_string(),
        registration.function_version.clone(),
    );
    if let Some(region) = region.filter(|r| !r.is_empty()) {
        labels.insert("region".to_string(), region);
    }
    labels.insert("source".to_string(), "lambda".to_string());
    labels
}

/// Orchestrates the whole extension: registration, receiver, subscription,
/// flush loop, event loop, shutdown.
pub struct Manager {
    config: Arc<Config>,
    buffer: Arc<LogBuffer>,
    runtime_api: String,
    telemetry_port: u16,
}

impl Manager {
    /// Creates the manager and attaches the shared buffer to the logger so
    /// the agent's own diagnostics enter the pipeline.
    #[must_use]
    pub fn new(config: Arc<Config>, runtime_api: String, telemetry_port: u16) -> Self {
        let buffer = Arc::new(LogBuffer::new(config.buffer_size));
        logger::attach_buffer(Arc::clone(&buffer));
        Manager {
            config,
            buffer,
            runtime_api,
            telemetry_port,
        }
    }

    /// Runs the extension until SHUTDOWN or cancellation.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), LifecycleError> {
        let mut control = ExtensionClient::new(&self.runtime_api);
        let registration = control.register().await?;
        info!(
            "LIFECYCLE | Registered extension for function {} (version {})",
            registration.function_name, registration.function_version
        );

        let labels = build_labels(
            &self.config,
            &registration,
            std::env::var("AWS_REGION").ok(),
        );
        let coordinator = Arc::new(FlushCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.buffer),
            LokiClient::new(&self.config),
            labels,
        ));

        let on_runtime_done: RuntimeDoneHandler = {
            let coordinator = Arc::clone(&coordinator);
            Arc::new(move |request_id: String| coordinator.on_runtime_done(request_id))
        };
        let receiver = TelemetryServer::new(
            Arc::clone(&self.buffer),
            self.telemetry_port,
            self.config.max_line_size,
            self.config.extract_request_id,
            Some(on_runtime_done),
        )
        .start(cancel.child_token())
        .await?;
        info!(
            "LIFECYCLE | Telemetry receiver listening on port {}",
            receiver.port()
        );

        let telemetry_client =
            TelemetryClient::new(&self.runtime_api, control.extension_id().to_string());
        telemetry_client.subscribe(&receiver.listener_uri()).await?;
        info!("LIFECYCLE | Subscribed to the Telemetry API");

        let flush_cancel = cancel.child_token();
        let flush_task = tokio::spawn(Arc::clone(&coordinator).run_flush_loop(flush_cancel.clone()));

        match Self::event_loop(&control, &coordinator, &cancel).await {
            Ok(()) => {
                Self::shutdown_sequence(flush_cancel, flush_task, receiver, &coordinator, &cancel)
                    .await;
                Ok(())
            }
            Err(e) => {
                flush_cancel.cancel();
                receiver.shutdown(RECEIVER_SHUTDOWN_GRACE).await;
                Err(e)
            }
        }
    }

    /// Consumes host control events; blocks on the invocation barrier
    /// between an INVOKE and its runtimeDone critical flush.
    async fn event_loop(
        control: &ExtensionClient,
        coordinator: &Arc<FlushCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let mut barrier: Option<oneshot::Receiver<()>> = None;

        loop {
            if let Some(rx) = barrier.take() {
                tokio::select! {
                    _ = rx => {}
                    () = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                }
            }

            let event = tokio::select! {
                event = control.next_event() => event?,
                () = cancel.cancelled() => return Err(LifecycleError::Cancelled),
            };

            match event.event_type {
                ExtensionEventType::Invoke => {
                    coordinator.set_state(ExtensionState::Active);
                    info!(
                        "LIFECYCLE | Received INVOKE for request {} (state: {})",
                        event.request_id,
                        coordinator.state()
                    );
                    barrier = Some(coordinator.arm_barrier());
                }
                ExtensionEventType::Shutdown => {
                    info!(
                        "LIFECYCLE | Received SHUTDOWN, reason: {}",
                        event.shutdown_reason
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown_sequence(
        flush_cancel: CancellationToken,
        flush_task: JoinHandle<()>,
        receiver: telemetry::server::RunningTelemetryServer,
        coordinator: &Arc<FlushCoordinator>,
        cancel: &CancellationToken,
    ) {
        flush_cancel.cancel();
        if let Err(e) = flush_task.await {
            debug!("LIFECYCLE | Flush loop task ended abnormally: {e}");
        }

        receiver.shutdown(RECEIVER_SHUTDOWN_GRACE).await;

        // Give the host a last chance to hand over trailing telemetry that
        // was already in flight.
        tokio::time::sleep(TRAILING_TELEMETRY_GRACE).await;

        coordinator.drain_and_push(cancel).await;
        info!("LIFECYCLE | Shutdown complete");
    }
}
