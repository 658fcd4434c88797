//! In-process MCP server for integration tests.
//!
//! Serves streamable HTTP on `POST /mcp` and legacy HTTP+SSE on `GET /sse` + `POST /messages`.
//! Tools: `echo` (returns `arguments.text`), `fail` (application error), `slow` (sleeps
//! `arguments.ms`). The catalog is split over two `tools/list` pages. Resources
//! `mock://readme` and `mock://logo`, and a `greet` prompt, are offered unless hidden.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use toolmux_mcp::ManagerOptions;

const SESSION_HEADER: &str = "mcp-session-id";
const SESSION_ID: &str = "mock-session";

#[derive(Default)]
struct MockState {
    online: AtomicBool,
    stalled: AtomicBool,
    catalog_hidden: AtomicBool,
    fail_next: AtomicU32,
    tool_calls: AtomicU32,
    initializations: AtomicU32,
    session_echoes: AtomicU32,
    deletes: AtomicU32,
    next_stream: AtomicU32,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        state.online.store(true, Ordering::SeqCst);

        let app = Router::new()
            .route("/mcp", post(handle_post).delete(handle_delete))
            .route("/sse", get(handle_sse))
            .route("/messages", post(handle_message))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    pub fn sse_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    /// While offline every request is answered with 503.
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    /// While stalled no JSON-RPC POST is ever answered. `DELETE` still is.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Leave resources and prompts out of the advertised capabilities.
    pub fn hide_resources_and_prompts(&self) {
        self.state.catalog_hidden.store(true, Ordering::SeqCst);
    }

    /// Answer the next `count` `tools/call` requests with 503.
    pub fn fail_next_calls(&self, count: u32) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// `tools/call` requests received, failed ones included.
    pub fn tool_calls(&self) -> u32 {
        self.state.tool_calls.load(Ordering::SeqCst)
    }

    pub fn initializations(&self) -> u32 {
        self.state.initializations.load(Ordering::SeqCst)
    }

    /// Requests that carried the session id handed out on `initialize`.
    pub fn session_echoes(&self) -> u32 {
        self.state.session_echoes.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.state.deletes.load(Ordering::SeqCst)
    }
}

/// Options with short intervals so failure paths finish quickly.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        call_timeout: Duration::from_secs(5),
        connect_timeout: Some(Duration::from_secs(5)),
        retry_attempts: 2,
        retry_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// An address nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/mcp")
}

enum Reply {
    Message(Value),
    Accepted,
    Unavailable,
}

async fn dispatch(state: &MockState, message: &Value) -> Reply {
    if state.stalled.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }
    if !state.online.load(Ordering::SeqCst) {
        return Reply::Unavailable;
    }
    let Some(id) = message.get("id").cloned() else {
        return Reply::Accepted;
    };
    let method = message["method"].as_str().unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => {
            state.initializations.fetch_add(1, Ordering::SeqCst);
            let capabilities = if state.catalog_hidden.load(Ordering::SeqCst) {
                json!({ "tools": {} })
            } else {
                json!({ "tools": {}, "resources": {}, "prompts": {} })
            };
            Ok(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": capabilities,
                "serverInfo": { "name": "mock", "version": "1.0.0" }
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(list_tools(&params)),
        "resources/list" => Ok(json!({
            "resources": [
                { "uri": "mock://readme", "name": "readme", "description": "Read me first", "mimeType": "text/plain" },
                { "uri": "mock://logo", "name": "logo", "mimeType": "image/png" }
            ]
        })),
        "resources/read" => match params["uri"].as_str().unwrap_or_default() {
            "mock://readme" => Ok(json!({
                "contents": [{ "uri": "mock://readme", "mimeType": "text/plain", "text": "hello from mock" }]
            })),
            "mock://logo" => Ok(json!({
                "contents": [{ "uri": "mock://logo", "mimeType": "image/png", "blob": "aGVsbG8=" }]
            })),
            other => Err((-32002, format!("resource not found: {other}"))),
        },
        "prompts/list" => Ok(json!({
            "prompts": [{
                "name": "greet",
                "description": "Greet someone",
                "arguments": [{ "name": "who", "required": true }]
            }]
        })),
        "prompts/get" => match params["name"].as_str().unwrap_or_default() {
            "greet" => {
                let who = params["arguments"]["who"].as_str().unwrap_or("stranger");
                Ok(json!({
                    "description": "Greet someone",
                    "messages": [{ "role": "user", "content": { "type": "text", "text": format!("Hello, {who}!") } }]
                }))
            }
            other => Err((-32602, format!("unknown prompt: {other}"))),
        },
        "tools/call" => {
            state.tool_calls.fetch_add(1, Ordering::SeqCst);
            let failing = state
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Reply::Unavailable;
            }
            call_tool(&params).await
        }
        other => Err((-32601, format!("method not found: {other}"))),
    };

    Reply::Message(match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }),
    })
}

fn list_tools(params: &Value) -> Value {
    let echo = json!({
        "name": "echo",
        "description": "Echo the given text",
        "inputSchema": { "type": "object", "properties": { "text": { "type": "string" } } }
    });
    let fail = json!({ "name": "fail", "description": "Always fails", "inputSchema": { "type": "object" } });
    let slow = json!({ "name": "slow", "inputSchema": { "type": "object" } });

    match params.get("cursor").and_then(Value::as_str) {
        Some("page-2") => json!({ "tools": [slow] }),
        _ => json!({ "tools": [echo, fail], "nextCursor": "page-2" }),
    }
}

async fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let arguments = &params["arguments"];
    match params["name"].as_str().unwrap_or_default() {
        "echo" => {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(json!({ "content": [{ "type": "text", "text": text }] }))
        }
        "fail" => Ok(json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true })),
        "slow" => {
            let ms = arguments["ms"].as_u64().unwrap_or(500);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "content": [{ "type": "text", "text": "done" }] }))
        }
        other => Err((-32602, format!("unknown tool: {other}"))),
    }
}

async fn handle_post(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(message): Json<Value>) -> Response {
    if headers.get(SESSION_HEADER).and_then(|value| value.to_str().ok()) == Some(SESSION_ID) {
        state.session_echoes.fetch_add(1, Ordering::SeqCst);
    }

    match dispatch(&state, &message).await {
        Reply::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "offline").into_response(),
        Reply::Accepted => StatusCode::ACCEPTED.into_response(),
        Reply::Message(reply) if message["method"] == "initialize" => {
            ([(SESSION_HEADER, SESSION_ID)], Json(reply)).into_response()
        }
        Reply::Message(reply) => Json(reply).into_response(),
    }
}

async fn handle_delete(State(state): State<Arc<MockState>>) -> StatusCode {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn handle_sse(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream_id = format!("s{}", state.next_stream.fetch_add(1, Ordering::SeqCst));
    let _ = tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("/messages?session_id={stream_id}")),
    );
    state.streams.lock().await.insert(stream_id, tx);

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(events)
}

async fn handle_message(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(message): Json<Value>,
) -> StatusCode {
    let sender = match query.get("session_id") {
        Some(id) => state.streams.lock().await.get(id).cloned(),
        None => None,
    };
    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND;
    };

    match dispatch(&state, &message).await {
        Reply::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Reply::Accepted => StatusCode::ACCEPTED,
        Reply::Message(reply) => {
            let _ = sender.send(Event::default().event("message").data(reply.to_string()));
            StatusCode::ACCEPTED
        }
    }
}
