//! Critical flush behavior: exhaustive batch draining at invocation end and
//! the invocation barrier.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::MockSink;
use loki_lambda_agent::buffer::{EntryKind, LogBuffer, LogEntry};
use loki_lambda_agent::config::Config;
use loki_lambda_agent::extension::lifecycle::{ExtensionState, FlushCoordinator};
use loki_lambda_agent::loki::client::LokiClient;

fn entry(message: &str) -> LogEntry {
    LogEntry {
        timestamp: 1_700_000_000_000,
        message: message.to_string(),
        kind: EntryKind::Function,
        request_id: String::new(),
    }
}

fn coordinator_for(
    config: Config,
) -> (Arc<FlushCoordinator>, Arc<LogBuffer>) {
    let config = Arc::new(config);
    let buffer = Arc::new(LogBuffer::new(config.buffer_size));
    let client = LokiClient::new(&config);
    let coordinator = Arc::new(FlushCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&buffer),
        client,
        BTreeMap::new(),
    ));
    (coordinator, buffer)
}

#[tokio::test]
async fn critical_flush_ships_everything_in_batches() {
    let sink = MockSink::start().await;
    let config = Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        batch_size: 10,
        // Count-capped batches only, so the split is exactly 10/10/5.
        max_batch_size_bytes: 0,
        ..Config::default()
    };
    let (coordinator, buffer) = coordinator_for(config);

    buffer.add_batch((0..25).map(|i| entry(&format!("line {i}"))).collect());

    let barrier = coordinator.arm_barrier();
    coordinator.on_runtime_done("req-1".to_string());

    timeout(Duration::from_secs(5), barrier)
        .await
        .expect("barrier should be released")
        .expect("barrier sender should have sent");

    assert!(sink.wait_for_requests(3, Duration::from_secs(2)).await);
    let sizes: Vec<usize> = sink
        .requests()
        .iter()
        .map(|request| request.decode().streams[0].values.len())
        .collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(buffer.len(), 0);
    assert_eq!(coordinator.state(), ExtensionState::Idle);
}

#[tokio::test]
async fn critical_flush_transitions_through_flushing() {
    let sink = MockSink::start().await;
    let config = Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    };
    let (coordinator, buffer) = coordinator_for(config);
    buffer.add(entry("only line"));

    let barrier = coordinator.arm_barrier();
    coordinator.on_runtime_done("req-2".to_string());
    // The transition to FLUSHING happens synchronously in on_runtime_done;
    // by the time the barrier is released the coordinator is IDLE again.
    timeout(Duration::from_secs(5), barrier)
        .await
        .expect("barrier should be released")
        .expect("barrier sender should have sent");
    assert_eq!(coordinator.state(), ExtensionState::Idle);
}

#[tokio::test]
async fn barrier_is_released_even_when_the_sink_fails() {
    // Closed port: every push attempt fails fast.
    let config = Config {
        loki_endpoint: "http://127.0.0.1:1/loki/api/v1/push".to_string(),
        enable_gzip: false,
        batch_size: 10,
        max_batch_size_bytes: 0,
        critical_flush_retries: 0,
        ..Config::default()
    };
    let (coordinator, buffer) = coordinator_for(config);
    buffer.add_batch((0..25).map(|i| entry(&format!("line {i}"))).collect());

    let barrier = coordinator.arm_barrier();
    coordinator.on_runtime_done("req-3".to_string());

    timeout(Duration::from_secs(5), barrier)
        .await
        .expect("barrier must be released on failure too")
        .expect("barrier sender should have sent");

    // The failed batch is gone (at-least-once does not hold across a failed
    // flush); the rest stays for later ticks.
    assert_eq!(buffer.len(), 15);
    assert_eq!(coordinator.state(), ExtensionState::Idle);
}

#[tokio::test]
async fn drain_and_push_closes_the_buffer() {
    let sink = MockSink::start().await;
    let config = Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    };
    let (coordinator, buffer) = coordinator_for(config);
    buffer.add_batch(vec![entry("a"), entry("b")]);

    let cancel = CancellationToken::new();
    coordinator.drain_and_push(&cancel).await;

    assert!(sink.wait_for_requests(1, Duration::from_secs(2)).await);
    assert_eq!(sink.requests()[0].decode().streams[0].values.len(), 2);

    // Closed: later producers are no-ops.
    buffer.add(entry("late"));
    assert_eq!(buffer.len(), 0);
}
