//! End-to-end pipeline tests: telemetry receiver → buffer → coordinator →
//! mock sink, and the full lifecycle manager against a scripted control API.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{MockRuntimeApi, MockSink};
use loki_lambda_agent::buffer::LogBuffer;
use loki_lambda_agent::config::Config;
use loki_lambda_agent::extension::lifecycle::{FlushCoordinator, LifecycleError, Manager};
use loki_lambda_agent::loki::client::LokiClient;
use loki_lambda_agent::telemetry::server::{RuntimeDoneHandler, TelemetryServer};

#[tokio::test]
async fn receiver_to_sink_round_trip() {
    let sink = MockSink::start().await;
    let config = Arc::new(Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    });

    let buffer = Arc::new(LogBuffer::new(config.buffer_size));
    let mut labels = BTreeMap::new();
    labels.insert("source".to_string(), "lambda".to_string());
    let coordinator = Arc::new(FlushCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&buffer),
        LokiClient::new(&config),
        labels,
    ));

    let on_runtime_done: RuntimeDoneHandler = {
        let coordinator = Arc::clone(&coordinator);
        Arc::new(move |request_id: String| coordinator.on_runtime_done(request_id))
    };
    let receiver = TelemetryServer::new(
        Arc::clone(&buffer),
        0,
        config.max_line_size,
        config.extract_request_id,
        Some(on_runtime_done),
    )
    .start(CancellationToken::new())
    .await
    .expect("receiver should bind");
    let receiver_url = format!("http://127.0.0.1:{}/", receiver.port());

    let barrier = coordinator.arm_barrier();

    // One invocation's worth of telemetry in a single batch.
    let batch = json!([
        {"time": "2026-02-05T08:12:42.100Z", "type": "platform.start",
         "record": {"requestId": "req-e2e", "version": "$LATEST"}},
        {"time": "2026-02-05T08:12:42.200Z", "type": "function",
         "record": "hello from the function"},
        {"time": "2026-02-05T08:12:42.300Z", "type": "function",
         "record": "{\"level\":\"info\",\"msg\":\"structured\"}"},
        {"time": "2026-02-05T08:12:42.400Z", "type": "platform.runtimeDone",
         "record": {"requestId": "req-e2e", "status": "success"}},
    ]);
    let response = reqwest::Client::new()
        .post(&receiver_url)
        .json(&batch)
        .send()
        .await
        .expect("telemetry post should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    timeout(Duration::from_secs(5), barrier)
        .await
        .expect("critical flush should release the barrier")
        .expect("barrier sender should have sent");
    assert!(sink.wait_for_requests(1, Duration::from_secs(2)).await);

    let pushed = sink.requests()[0].decode();
    assert_eq!(pushed.streams.len(), 1);
    let stream = &pushed.streams[0];
    assert_eq!(stream.stream.get("source").map(String::as_str), Some("lambda"));

    let lines: Vec<&str> = stream.values.iter().map(|pair| pair[1].as_str()).collect();
    assert_eq!(lines.len(), 4);
    // Order is preserved and every line carries the request id: plain lines
    // by prefix, JSON lines by first-field injection.
    assert_eq!(lines[0], "[request_id=req-e2e] START RequestId: req-e2e Version: $LATEST");
    assert_eq!(lines[1], "[request_id=req-e2e] hello from the function");
    assert_eq!(
        lines[2],
        "{\"request_id\":\"req-e2e\",\"level\":\"info\",\"msg\":\"structured\"}"
    );
    assert!(lines[3].starts_with("{\"request_id\":\"req-e2e\","));

    // Timestamps are nanosecond decimal strings in order.
    let ts: Vec<i64> = stream
        .values
        .iter()
        .map(|pair| pair[0].parse().expect("decimal nanoseconds"))
        .collect();
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ts[0] % 1_000_000, 0);

    receiver.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn full_manager_lifecycle_invoke_runtime_done_shutdown() {
    let sink = MockSink::start().await;
    let runtime = MockRuntimeApi::start().await;
    let config = Arc::new(Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    });

    // Script: one invocation, then spindown. The SHUTDOWN is only polled
    // after the invocation barrier is released.
    runtime.queue_invoke("req-full");
    runtime.queue_shutdown();

    let manager = Manager::new(Arc::clone(&config), runtime.runtime_api(), 0);
    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(manager.run(cancel));

    let receiver_url = runtime
        .wait_for_subscription(Duration::from_secs(5))
        .await
        .expect("manager should subscribe to the telemetry API");
    // Let the event loop consume the INVOKE and arm the barrier before the
    // invocation's telemetry lands.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let batch = json!([
        {"time": "2026-02-05T08:12:42.100Z", "type": "platform.start",
         "record": {"requestId": "req-full", "version": "$LATEST"}},
        {"time": "2026-02-05T08:12:42.200Z", "type": "function",
         "record": "invocation output"},
        {"time": "2026-02-05T08:12:42.400Z", "type": "platform.runtimeDone",
         "record": {"requestId": "req-full", "status": "success"}},
    ]);
    let response = reqwest::Client::new()
        .post(&receiver_url)
        .json(&batch)
        .send()
        .await
        .expect("telemetry post should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // runtimeDone → critical flush → barrier → SHUTDOWN → drain → exit.
    let result = timeout(Duration::from_secs(10), run_task)
        .await
        .expect("manager should shut down in time")
        .expect("manager task should not panic");
    assert!(result.is_ok(), "manager exited with {result:?}");

    assert!(sink.wait_for_requests(1, Duration::from_secs(2)).await);
    let all_lines: Vec<String> = sink
        .requests()
        .iter()
        .flat_map(|request| request.decode().streams)
        .flat_map(|stream| stream.values)
        .map(|pair| pair[1].clone())
        .collect();
    assert!(all_lines.iter().any(|line| line.contains("invocation output")));

    // Auto-labels from registration made it onto the stream.
    let first = sink.requests()[0].decode();
    let labels = &first.streams[0].stream;
    assert_eq!(
        labels.get("function_name").map(String::as_str),
        Some("demo-function")
    );
    assert_eq!(labels.get("source").map(String::as_str), Some("lambda"));
}

#[tokio::test]
async fn manager_propagates_cancellation() {
    let sink = MockSink::start().await;
    let runtime = MockRuntimeApi::start().await;
    let config = Arc::new(Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    });

    // No scripted events: the manager parks in the next-event long poll.
    let manager = Manager::new(Arc::clone(&config), runtime.runtime_api(), 0);
    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(manager.run(cancel.clone()));

    runtime
        .wait_for_subscription(Duration::from_secs(5))
        .await
        .expect("manager should reach the event loop");
    cancel.cancel();

    let result = timeout(Duration::from_secs(5), run_task)
        .await
        .expect("cancellation should unblock the manager")
        .expect("manager task should not panic");
    assert!(matches!(result, Err(LifecycleError::Cancelled)));
}

#[tokio::test]
async fn malformed_telemetry_gets_400_and_valid_telemetry_still_flows() {
    let sink = MockSink::start().await;
    let config = Arc::new(Config {
        loki_endpoint: sink.url(),
        enable_gzip: false,
        ..Config::default()
    });
    let buffer = Arc::new(LogBuffer::new(config.buffer_size));

    let receiver = TelemetryServer::new(Arc::clone(&buffer), 0, 0, true, None)
        .start(CancellationToken::new())
        .await
        .expect("receiver should bind");
    let receiver_url = format!("http://127.0.0.1:{}/", receiver.port());
    let client = reqwest::Client::new();

    let response = client
        .post(&receiver_url)
        .body("{ definitely not a telemetry array")
        .send()
        .await
        .expect("post should complete");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(buffer.len(), 0);

    let response = client
        .post(&receiver_url)
        .json(&json!([
            {"time": "2026-02-05T08:12:42.100Z", "type": "function", "record": "still alive"}
        ]))
        .send()
        .await
        .expect("post should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(buffer.len(), 1);

    receiver.shutdown(Duration::from_secs(1)).await;
}
