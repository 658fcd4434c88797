//! JSON-RPC 2.0 envelopes and request/response correlation for the SSE transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use crate::types::TransportError;

/// JSON-RPC error code for "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

type Waiter = oneshot::Sender<Result<Value, TransportError>>;

/// Build a request envelope.
pub(crate) fn request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Build a notification envelope (no id, no response expected).
pub(crate) fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Successful reply to a server-initiated request.
pub(crate) fn result_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Error reply to a server-initiated request.
pub(crate) fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Extract the `result` of a response, mapping a JSON-RPC `error` object to
/// [`TransportError::Remote`].
pub(crate) fn decode_response(message: Value) -> Result<Value, TransportError> {
    let Value::Object(mut map) = message else {
        return Err(TransportError::Malformed("response is not a JSON object".to_string()));
    };

    if let Some(error) = map.remove("error").filter(|error| !error.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(TransportError::Remote { code, message });
    }

    map.remove("result")
        .ok_or_else(|| TransportError::Malformed("response carries neither result nor error".to_string()))
}

/// Numeric id of a message. Servers may echo ids back as strings.
pub(crate) fn message_id(message: &Value) -> Option<u64> {
    match message.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Shape of a message read from a server.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    /// Reply to one of our requests.
    Response(u64),
    /// Server-initiated request awaiting a reply.
    Request { id: Value, method: String },
    /// Server-initiated notification.
    Notification(String),
    /// Anything else (unknown id type, missing fields).
    Unrecognized,
}

pub(crate) fn classify(message: &Value) -> Incoming {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());
    match (method, id) {
        (Some(method), Some(id)) => Incoming::Request {
            id: id.clone(),
            method: method.to_string(),
        },
        (Some(method), None) => Incoming::Notification(method.to_string()),
        (None, Some(_)) => message_id(message).map_or(Incoming::Unrecognized, Incoming::Response),
        (None, None) => Incoming::Unrecognized,
    }
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, Waiter>,
    closed: Option<String>,
}

/// Requests awaiting a response, keyed by JSON-RPC id.
///
/// Once [`fail_all`](Self::fail_all) has run, new registrations are refused so that no caller
/// waits on a transport that can no longer answer.
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Allocate an id and the receiver its response will be delivered to.
    pub(crate) async fn register(&self) -> Result<(u64, oneshot::Receiver<Result<Value, TransportError>>), TransportError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(TransportError::closed(reason.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Deliver a response message to whoever is waiting on `id`.
    pub(crate) async fn resolve(&self, id: u64, message: Value) {
        let waiter = self.state.lock().await.waiters.remove(&id);
        match waiter {
            Some(tx) => {
                if tx.send(decode_response(message)).is_err() {
                    debug!("response receiver for id={} was dropped", id);
                }
            }
            None => debug!("unmatched response with id={}", id),
        }
    }

    /// Drop the waiter for `id` without delivering anything.
    pub(crate) async fn forget(&self, id: u64) {
        self.state.lock().await.waiters.remove(&id);
    }

    /// Fail every outstanding request and refuse new ones.
    pub(crate) async fn fail_all(&self, reason: &str) {
        let waiters = {
            let mut state = self.state.lock().await;
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            std::mem::take(&mut state.waiters)
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(TransportError::closed(reason)));
        }
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.state.lock().await.closed.is_some()
    }

    /// Wait for the response to `id`, giving up after `timeout`.
    pub(crate) async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Value, TransportError>>,
        method: &str,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::closed("response channel dropped")),
            Err(_) => {
                self.forget(id).await;
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}
