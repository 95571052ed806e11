//! Shared test utilities for lambda-collector-extension integration tests.
//!
//! Provides a scripted Extensions API host, a recording supervisor and
//! event-driven waiting helpers so tests do not rely on arbitrary sleeps.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lambda_collector_extension::{
    CollectorCommand, ExitInfo, ExtensionError, Result, SpawnError, Supervisor,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Identifier the mock host hands out at registration.
pub const EXTENSION_ID: &str = "9a3b2c1d-0000-4000-8000-000000000001";

/// What the mock host answers to one `/event/next` poll.
#[derive(Debug, Clone)]
pub enum NextResponse {
    /// A JSON event body with status 200.
    Event(Value),
    /// An error status with a short body.
    Status(u16),
    /// A 200 response whose body is not a lifecycle event.
    Malformed,
}

impl NextResponse {
    pub fn invoke(request_id: &str) -> Self {
        NextResponse::Event(json!({
            "eventType": "INVOKE",
            "deadlineMs": 3000,
            "requestId": request_id,
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:test-function",
            "tracing": {
                "type": "X-Amzn-Trace-Id",
                "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2;Parent=2be948a625588e32;Sampled=1"
            }
        }))
    }

    pub fn shutdown(reason: &str, deadline_ms: i64) -> Self {
        NextResponse::Event(json!({
            "eventType": "SHUTDOWN",
            "shutdownReason": reason,
            "deadlineMs": deadline_ms
        }))
    }
}

/// A reported init or exit error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub path: String,
    pub error_type: String,
}

#[derive(Default)]
struct HostState {
    register_status: Option<u16>,
    omit_identifier: bool,
    register_delay: Option<Duration>,
    events: Mutex<VecDeque<NextResponse>>,
    registrations: Mutex<Vec<(String, Value)>>,
    polls: AtomicUsize,
    errors: Mutex<Vec<ReportedError>>,
}

/// Builder for [`MockHost`].
#[derive(Default)]
pub struct MockHostBuilder {
    state: HostState,
}

impl MockHostBuilder {
    /// Answers registration with the given status.
    pub fn reject_registration(mut self, status: u16) -> Self {
        self.state.register_status = Some(status);
        self
    }

    /// Accepts registration but leaves out the identifier header.
    pub fn omit_identifier(mut self) -> Self {
        self.state.omit_identifier = true;
        self
    }

    /// Holds each registration response for `delay`.
    pub fn delay_registration(mut self, delay: Duration) -> Self {
        self.state.register_delay = Some(delay);
        self
    }

    /// Queues a response for the next poll.
    pub fn next(self, response: NextResponse) -> Self {
        self.state
            .events
            .lock()
            .unwrap()
            .push_back(response);
        self
    }

    pub async fn start(self) -> MockHost {
        let state = Arc::new(self.state);

        let router = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2020-01-01/extension/init/error", post(init_error))
            .route("/2020-01-01/extension/exit/error", post(exit_error))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock host");
        let addr = listener.local_addr().expect("Failed to read mock host address");

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("Mock host failed");
        });

        MockHost { addr, state, task }
    }
}

/// A scripted Lambda Extensions API.
///
/// Polls are answered from the queued responses in order; once the queue is
/// empty a poll is held open forever, like an idle Lambda environment.
pub struct MockHost {
    addr: SocketAddr,
    state: Arc<HostState>,
    task: JoinHandle<()>,
}

impl MockHost {
    pub fn builder() -> MockHostBuilder {
        MockHostBuilder::default()
    }

    /// Address in the `AWS_LAMBDA_RUNTIME_API` format.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    pub fn polls(&self) -> usize {
        self.state.polls.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> Vec<(String, Value)> {
        self.state.registrations.lock().unwrap().clone()
    }

    pub fn reported_errors(&self) -> Vec<ReportedError> {
        self.state.errors.lock().unwrap().clone()
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn register(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let name = header(&headers, "Lambda-Extension-Name").unwrap_or_default();
    state.registrations.lock().unwrap().push((name, body));

    if let Some(delay) = state.register_delay {
        tokio::time::sleep(delay).await;
    }

    if let Some(status) = state.register_status {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "registration rejected").into_response();
    }

    let mut response = Json(json!({
        "functionName": "test-function",
        "functionVersion": "$LATEST",
        "handler": "handler"
    }))
    .into_response();

    let headers = response.headers_mut();
    if !state.omit_identifier {
        headers.insert("Lambda-Extension-Identifier", EXTENSION_ID.parse().unwrap());
    }
    headers.insert("Lambda-Extension-Function-Name", "test-function".parse().unwrap());
    headers.insert("Lambda-Extension-Function-Version", "$LATEST".parse().unwrap());

    response
}

async fn next_event(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    if header(&headers, "Lambda-Extension-Identifier").as_deref() != Some(EXTENSION_ID) {
        return (StatusCode::FORBIDDEN, "Extension not registered").into_response();
    }

    state.polls.fetch_add(1, Ordering::SeqCst);
    let next = state.events.lock().unwrap().pop_front();

    match next {
        Some(NextResponse::Event(body)) => Json(body).into_response(),
        Some(NextResponse::Status(status)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "event unavailable",
        )
            .into_response(),
        Some(NextResponse::Malformed) => (StatusCode::OK, "not json").into_response(),
        None => std::future::pending::<Response>().await,
    }
}

async fn record_error(state: &HostState, path: &str, headers: &HeaderMap) -> Response {
    state.errors.lock().unwrap().push(ReportedError {
        path: path.to_string(),
        error_type: header(headers, "Lambda-Extension-Function-Error-Type").unwrap_or_default(),
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "OK" }))).into_response()
}

async fn init_error(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    record_error(&state, "init/error", &headers).await
}

async fn exit_error(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    record_error(&state, "exit/error", &headers).await
}

struct RecordingState {
    fail_start: bool,
    starts: AtomicUsize,
    stops: Mutex<Vec<Duration>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self {
            fail_start: false,
            starts: AtomicUsize::new(0),
            stops: Mutex::new(Vec::new()),
            exit_tx: watch::channel(None).0,
        }
    }
}

/// A [`Supervisor`] that records calls instead of spawning processes.
#[derive(Clone, Default)]
pub struct RecordingSupervisor {
    state: Arc<RecordingState>,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A supervisor whose `start` always fails with a missing executable.
    pub fn failing() -> Self {
        Self {
            state: Arc::new(RecordingState {
                fail_start: true,
                ..Default::default()
            }),
        }
    }

    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> Vec<Duration> {
        self.state.stops.lock().unwrap().clone()
    }

    /// Simulates the collector exiting on its own.
    pub fn crash(&self, exit: ExitInfo) {
        self.state.exit_tx.send_replace(Some(exit));
    }
}

impl Supervisor for RecordingSupervisor {
    type Process = ();

    async fn start(&self, _command: &CollectorCommand) -> Result<()> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_start {
            return Err(ExtensionError::Start(SpawnError::NotFound(
                "/missing/otelcol".into(),
            )));
        }
        Ok(())
    }

    async fn exited(&self, _process: &()) -> ExitInfo {
        let mut rx = self.state.exit_tx.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map(|exit| (*exit).unwrap_or_default())
            .unwrap_or_default();
        exit
    }

    async fn stop(&self, _process: &(), grace: Duration) -> Result<()> {
        self.state.stops.lock().unwrap().push(grace);
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
