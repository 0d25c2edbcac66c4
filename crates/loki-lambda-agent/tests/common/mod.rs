//! Shared mock servers for the integration suite: a recording Loki sink
//! with a scriptable status sequence, and a scripted Extensions API.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use loki_lambda_agent::loki::types::PushRequest;

/// One request as the mock sink saw it.
#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// Decompresses (when gzip) and parses the body as a push request.
    pub fn decode(&self) -> PushRequest {
        let raw = if self.headers.get("content-encoding").map(String::as_str) == Some("gzip") {
            let mut decoder = flate2::read::GzDecoder::new(&self.body[..]);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .expect("body should gunzip");
            decompressed
        } else {
            self.body.clone()
        };
        serde_json::from_slice(&raw).expect("body should parse as a push request")
    }
}

struct SinkState {
    requests: Mutex<Vec<ReceivedRequest>>,
    // Statuses to answer with, in order; exhausted -> 200.
    statuses: Mutex<VecDeque<u16>>,
}

/// Recording mock for the Loki push endpoint.
#[derive(Clone)]
pub struct MockSink {
    addr: SocketAddr,
    state: Arc<SinkState>,
}

impl MockSink {
    pub async fn start() -> Self {
        Self::start_with_statuses(Vec::new()).await
    }

    /// Starts a sink that answers the scripted statuses in order, then 200.
    pub async fn start_with_statuses(statuses: Vec<u16>) -> Self {
        let state = Arc::new(SinkState {
            requests: Mutex::new(Vec::new()),
            statuses: Mutex::new(statuses.into_iter().collect()),
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock sink should bind");
        let addr = listener.local_addr().expect("local addr");

        let router = Router::new()
            .route("/", post(sink_handler))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockSink { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().expect("lock").len()
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().expect("lock").clone()
    }

    /// Polls until the sink has seen at least `count` requests.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.request_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

async fn sink_handler(
    State(state): State<Arc<SinkState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    state.requests.lock().expect("lock").push(ReceivedRequest {
        headers,
        body: body.to_vec(),
    });

    let status = state
        .statuses
        .lock()
        .expect("lock")
        .pop_front()
        .unwrap_or(200);
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

struct RuntimeState {
    events: Mutex<VecDeque<Value>>,
    subscriptions: Mutex<Vec<Value>>,
}

/// Scripted mock of the Lambda Extensions + Telemetry control APIs.
#[derive(Clone)]
pub struct MockRuntimeApi {
    addr: SocketAddr,
    state: Arc<RuntimeState>,
}

impl MockRuntimeApi {
    pub async fn start() -> Self {
        let state = Arc::new(RuntimeState {
            events: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock runtime should bind");
        let addr = listener.local_addr().expect("local addr");

        let router = Router::new()
            .route("/2020-01-01/extension/register", post(register_handler))
            .route("/2020-01-01/extension/event/next", get(next_event_handler))
            .route("/2022-07-01/telemetry", put(subscribe_handler))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockRuntimeApi { addr, state }
    }

    /// `host:port`, the shape `AWS_LAMBDA_RUNTIME_API` carries.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    pub fn queue_invoke(&self, request_id: &str) {
        self.state.events.lock().expect("lock").push_back(json!({
            "eventType": "INVOKE",
            "deadlineMs": 1_700_000_060_000u64,
            "requestId": request_id,
            "invokedFunctionArn": "arn:aws:lambda:eu-west-1:123456789012:function:demo",
        }));
    }

    pub fn queue_shutdown(&self) {
        self.state.events.lock().expect("lock").push_back(json!({
            "eventType": "SHUTDOWN",
            "deadlineMs": 1_700_000_060_000u64,
            "shutdownReason": "spindown",
        }));
    }

    /// The listener URI recorded from the telemetry subscription, rewritten
    /// to loopback so tests can post to the receiver.
    pub fn receiver_url(&self) -> Option<String> {
        let subscriptions = self.state.subscriptions.lock().expect("lock");
        let uri = subscriptions
            .last()?
            .get("destination")?
            .get("URI")?
            .as_str()?;
        let port = uri.rsplit(':').next()?;
        Some(format!("http://127.0.0.1:{port}/"))
    }

    /// Polls until a telemetry subscription has been recorded.
    pub async fn wait_for_subscription(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(url) = self.receiver_url() {
                return Some(url);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

async fn register_handler(State(_state): State<Arc<RuntimeState>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Lambda-Extension-Identifier",
        "test-extension-id".parse().expect("header value"),
    );
    (
        StatusCode::OK,
        headers,
        Json(json!({
            "functionName": "demo-function",
            "functionVersion": "$LATEST",
            "handler": "index.handler",
        })),
    )
}

async fn next_event_handler(State(state): State<Arc<RuntimeState>>) -> Json<Value> {
    // Long-poll: block until the script provides the next event.
    loop {
        if let Some(event) = state.events.lock().expect("lock").pop_front() {
            return Json(event);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn subscribe_handler(
    State(state): State<Arc<RuntimeState>>,
    Json(subscription): Json<Value>,
) -> StatusCode {
    state
        .subscriptions
        .lock()
        .expect("lock")
        .push(subscription);
    StatusCode::OK
}
