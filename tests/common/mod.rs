//! In-process MCP server double
//!
//! Serves both transports on an ephemeral port:
//! - `GET /sse` + `POST /message?sessionId=` (legacy)
//! - `POST|GET|DELETE /mcp` (Streamable HTTP)
//! - `GET /silent/sse` never sends the endpoint event
//! - `GET /nosession/sse` announces an endpoint without `sessionId`
//!
//! Tools: `echo`, `add`, `longRunningOperation` (progress only when the call
//! carries `_meta.progressToken`).

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use futures::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use mcp_probe::client::ClientOptions;
use mcp_probe::protocol::Root;
use mcp_probe::transport::HttpClient;

type EventBody = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Id of the `roots/list` request the double sends after `notifications/initialized`
pub const ROOTS_REQUEST_ID: &str = "srv-roots-1";

#[derive(Default)]
struct Inner {
    sse_sessions: HashMap<String, mpsc::UnboundedSender<Value>>,
    http_sessions: HashSet<String>,
    http_listeners: Vec<mpsc::UnboundedSender<Value>>,
    posted: Vec<(Option<String>, Value)>,
    client_responses: Vec<Value>,
    deleted: Vec<String>,
    delete_accept: Vec<String>,
}

/// Shared server state, inspectable from tests
#[derive(Clone, Default)]
pub struct DoubleState {
    inner: Arc<Mutex<Inner>>,
}

impl DoubleState {
    /// Every message posted, with the `Mcp-Session-Id` header it carried
    pub fn posted(&self) -> Vec<(Option<String>, Value)> {
        self.inner.lock().unwrap().posted.clone()
    }

    /// Responses the client sent to server-initiated requests
    pub fn client_responses(&self) -> Vec<Value> {
        self.inner.lock().unwrap().client_responses.clone()
    }

    /// Sessions terminated with DELETE
    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    /// `Accept` header of every DELETE
    pub fn delete_accept(&self) -> Vec<String> {
        self.inner.lock().unwrap().delete_accept.clone()
    }

    /// Whether a legacy session is known
    pub fn has_sse_session(&self, id: &str) -> bool {
        self.inner.lock().unwrap().sse_sessions.contains_key(id)
    }

    /// Forget a Streamable HTTP session, as a restarted server would
    pub fn forget_http_session(&self, id: &str) {
        self.inner.lock().unwrap().http_sessions.remove(id);
    }

    /// Forget a legacy session; its `/sse` stream ends with it
    pub fn forget_sse_session(&self, id: &str) {
        self.inner.lock().unwrap().sse_sessions.remove(id);
    }

    /// Forget every Streamable HTTP session
    pub fn forget_http_sessions(&self) {
        self.inner.lock().unwrap().http_sessions.clear();
    }
}

/// Running server double
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: DoubleState,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = DoubleState::default();
        let app = Router::new()
            .route("/sse", get(sse_open))
            .route("/silent/sse", get(silent_sse))
            .route("/nosession/sse", get(nosession_sse))
            .route("/message", axum::routing::post(sse_message))
            .route("/mcp", get(mcp_get).post(mcp_post).delete(mcp_delete))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{path}", self.addr)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// HTTP client with short timeouts for tests
pub fn http_client() -> HttpClient {
    HttpClient::new(
        &HashMap::new(),
        Duration::from_secs(2),
        Duration::from_secs(5),
        mcp_probe::protocol::PROTOCOL_VERSION,
    )
    .unwrap()
}

/// Client options with one root and a short request timeout
pub fn client_options() -> ClientOptions {
    ClientOptions {
        roots: vec![Root {
            uri: "file:///workspace".to_string(),
            name: Some("workspace".to_string()),
        }],
        request_timeout: Duration::from_secs(5),
        ..ClientOptions::default()
    }
}

fn data_event(value: &Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(value.to_string()))
}

// ============================================================================
// Legacy SSE
// ============================================================================

async fn sse_open(State(state): State<DoubleState>) -> Sse<EventBody> {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    state
        .inner
        .lock()
        .unwrap()
        .sse_sessions
        .insert(session_id.clone(), tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"));
    let body: EventBody = Box::pin(
        stream::once(async move { Ok(endpoint) })
            .chain(UnboundedReceiverStream::new(rx).map(|v| data_event(&v))),
    );
    Sse::new(body)
}

async fn silent_sse() -> Sse<EventBody> {
    let body: EventBody = Box::pin(stream::pending::<Result<Event, Infallible>>());
    Sse::new(body)
}

async fn nosession_sse() -> Sse<EventBody> {
    let endpoint = Event::default().event("endpoint").data("/message");
    let body: EventBody =
        Box::pin(stream::once(async move { Ok(endpoint) }).chain(stream::pending()));
    Sse::new(body)
}

async fn sse_message(
    State(state): State<DoubleState>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = query.get("sessionId").cloned().unwrap_or_default();
    let mut inner = state.inner.lock().unwrap();
    let Some(tx) = inner.sse_sessions.get(&session_id).cloned() else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };
    inner.posted.push((None, body.clone()));

    if is_client_response(&body) {
        inner.client_responses.push(body);
        return StatusCode::ACCEPTED.into_response();
    }
    drop(inner);

    if body["method"] == "notifications/initialized" {
        let _ = tx.send(json!({"jsonrpc": "2.0", "id": ROOTS_REQUEST_ID, "method": "roots/list"}));
    }
    for message in handle(&body) {
        let _ = tx.send(message);
    }
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// Streamable HTTP
// ============================================================================

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn mcp_post(
    State(state): State<DoubleState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let header = session_header(&headers);
    let mut inner = state.inner.lock().unwrap();
    inner.posted.push((header.clone(), body.clone()));

    if body["method"] == "initialize" {
        let session_id = uuid::Uuid::new_v4().to_string();
        inner.http_sessions.insert(session_id.clone());
        let reply = handle(&body).pop().unwrap_or(Value::Null);
        return ([("Mcp-Session-Id", session_id)], Json(reply)).into_response();
    }

    match &header {
        Some(id) if inner.http_sessions.contains(id) => {}
        _ => return (StatusCode::NOT_FOUND, "Session not found").into_response(),
    }

    if is_client_response(&body) {
        inner.client_responses.push(body);
        return StatusCode::ACCEPTED.into_response();
    }
    drop(inner);

    if body.get("id").is_none() {
        return StatusCode::ACCEPTED.into_response();
    }

    let mut messages = handle(&body);
    if messages.len() == 1 {
        let reply = messages.pop().unwrap_or(Value::Null);
        return Json(reply).into_response();
    }
    let events: Vec<Result<Event, Infallible>> = messages.iter().map(data_event).collect();
    let body: EventBody = Box::pin(stream::iter(events));
    Sse::new(body).into_response()
}

async fn mcp_get(State(state): State<DoubleState>, headers: HeaderMap) -> Response {
    let mut inner = state.inner.lock().unwrap();
    match session_header(&headers) {
        Some(id) if inner.http_sessions.contains(&id) => {}
        _ => return (StatusCode::NOT_FOUND, "Session not found").into_response(),
    }
    let (tx, rx) = mpsc::unbounded_channel();
    inner.http_listeners.push(tx);
    let body: EventBody = Box::pin(UnboundedReceiverStream::new(rx).map(|v| data_event(&v)));
    Sse::new(body).into_response()
}

async fn mcp_delete(State(state): State<DoubleState>, headers: HeaderMap) -> StatusCode {
    let mut inner = state.inner.lock().unwrap();
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    inner.delete_accept.push(accept);
    match session_header(&headers) {
        Some(id) if inner.http_sessions.remove(&id) => {
            inner.deleted.push(id);
            StatusCode::OK
        }
        _ => StatusCode::NOT_FOUND,
    }
}

// ============================================================================
// Method handling
// ============================================================================

fn is_client_response(body: &Value) -> bool {
    body.get("method").is_none() && (body.get("result").is_some() || body.get("error").is_some())
}

fn success(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn failure(id: &Value, code: i32, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text(s: String) -> Value {
    json!({"content": [{"type": "text", "text": s}]})
}

/// Messages the server emits for one inbound message, response last
fn handle(body: &Value) -> Vec<Value> {
    let Some(method) = body["method"].as_str() else {
        return Vec::new();
    };
    let Some(id) = body.get("id") else {
        return Vec::new();
    };
    let params = &body["params"];

    match method {
        "initialize" => vec![success(
            id,
            json!({
                "protocolVersion": params["protocolVersion"].as_str().unwrap_or("2025-06-18"),
                "capabilities": {
                    "tools": {},
                    "resources": {"subscribe": true},
                    "logging": {}
                },
                "serverInfo": {"name": "example-servers/everything", "version": "1.0.0"}
            }),
        )],
        "ping" => vec![success(id, json!({}))],
        "tools/list" => vec![success(
            id,
            json!({"tools": [
                {"name": "echo", "description": "Echoes back the input",
                 "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}},
                {"name": "add", "description": "Adds two numbers",
                 "inputSchema": {"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}},
                {"name": "longRunningOperation",
                 "description": "Demonstrates a long running operation with progress updates",
                 "inputSchema": {"type": "object", "properties": {
                     "duration": {"type": "number"}, "steps": {"type": "number"}}}}
            ]}),
        )],
        "resources/list" => vec![success(
            id,
            json!({"resources": [
                {"uri": "test://static/resource/1", "name": "Resource 1", "mimeType": "text/plain"}
            ]}),
        )],
        "tools/call" => call_tool(id, params),
        other => vec![failure(id, -32601, format!("Method not found: {other}"))],
    }
}

fn call_tool(id: &Value, params: &Value) -> Vec<Value> {
    let args = &params["arguments"];
    match params["name"].as_str().unwrap_or_default() {
        "echo" => vec![success(
            id,
            text(format!("Echo: {}", args["message"].as_str().unwrap_or_default())),
        )],
        "add" => {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            vec![success(id, text(format!("The sum of {} and {} is {sum}.", args["a"], args["b"])))]
        }
        "longRunningOperation" => {
            let duration = args["duration"].as_f64().unwrap_or(10.0);
            let steps = args["steps"].as_u64().unwrap_or(5);
            let mut messages = Vec::new();
            if let Some(token) = params.pointer("/_meta/progressToken") {
                for step in 1..=steps {
                    messages.push(json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/progress",
                        "params": {"progressToken": token, "progress": step, "total": steps}
                    }));
                }
            }
            messages.push(success(
                id,
                text(format!(
                    "Long running operation completed. Duration: {duration} seconds, Steps: {steps}."
                )),
            ));
            messages
        }
        other => vec![failure(id, -32602, format!("Unknown tool: {other}"))],
    }
}
