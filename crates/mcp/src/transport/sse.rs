//! Legacy HTTP+SSE transport.
//!
//! A `GET` on the configured url opens a persistent event stream. Its first `endpoint` event
//! names the url that requests are POSTed to; responses come back as `message` events and are
//! matched to their callers by JSON-RPC id.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::transport::event_stream::{EventStreamBuffer, SseFrame};
use crate::transport::http::{build_headers, parse_url};
use crate::transport::rpc::{self, Incoming, PendingRequests};
use crate::types::{ConnectError, TransportError};

pub struct SseTransport {
    server: String,
    client: Client,
    post_url: Url,
    pending: Arc<PendingRequests>,
    listener: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(config: &ServerConfig) -> Result<Self, ConnectError> {
        let stream_url = parse_url(config)?;
        let client = Client::builder()
            .default_headers(build_headers(config))
            .build()
            .map_err(ConnectError::HttpClient)?;

        let response = client
            .get(stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|error| ConnectError::Handshake {
                message: error.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ConnectError::Handshake {
                message: format!("event stream returned HTTP {}", response.status()),
            });
        }

        let (mut response, buffer, endpoint) = await_endpoint(response).await?;
        let post_url = stream_url.join(&endpoint).map_err(|source| ConnectError::InvalidUrl {
            url: endpoint.clone(),
            source,
        })?;
        debug!(server = %config.name, "event stream endpoint: {post_url}");

        let pending = Arc::new(PendingRequests::new());
        let listener = {
            let server = config.name.clone();
            let client = client.clone();
            let post_url = post_url.clone();
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let mut buffer = buffer;
                let reason = listen(&server, &mut response, &mut buffer, &client, &post_url, &pending).await;
                debug!(server = %server, "{reason}");
                pending.fail_all(&reason).await;
            })
        };

        Ok(Self {
            server: config.name.clone(),
            client,
            post_url,
            pending,
            listener,
        })
    }

    pub async fn send_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, TransportError> {
        let (id, rx) = self.pending.register().await?;
        let posted = tokio::time::timeout(
            timeout,
            post_message(&self.client, &self.post_url, &rpc::request(id, method, params)),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                method: method.to_string(),
                timeout,
            })
        });
        if let Err(error) = posted {
            self.pending.forget(id).await;
            return Err(error);
        }
        self.pending.wait(id, rx, method, timeout).await
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.pending.is_closed().await {
            return Err(TransportError::closed("event stream closed"));
        }
        post_message(&self.client, &self.post_url, &rpc::notification(method, params)).await
    }

    pub async fn close(&self) {
        self.listener.abort();
        self.pending.fail_all("transport closed").await;
        debug!(server = %self.server, "event stream closed");
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn post_message(client: &Client, url: &Url, message: &Value) -> Result<(), TransportError> {
    let response = client.post(url.clone()).json(message).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}

/// Read frames until the `endpoint` event arrives. Returns the response and the buffer so
/// the listener continues where the handshake stopped.
async fn await_endpoint(mut response: Response) -> Result<(Response, EventStreamBuffer, String), ConnectError> {
    let mut buffer = EventStreamBuffer::new();
    loop {
        while let Some(frame) = buffer.next_frame() {
            if frame.event_type() == "endpoint"
                && let Some(endpoint) = frame.data.filter(|data| !data.trim().is_empty())
            {
                return Ok((response, buffer, endpoint.trim().to_string()));
            }
        }
        match response.chunk().await {
            Ok(Some(chunk)) => buffer.push(&chunk),
            Ok(None) => {
                return Err(ConnectError::Handshake {
                    message: "event stream ended before the endpoint event".to_string(),
                });
            }
            Err(error) => {
                return Err(ConnectError::Handshake {
                    message: error.to_string(),
                });
            }
        }
    }
}

/// Dispatch events until the stream ends. Returns the reason it ended.
async fn listen(
    server: &str,
    response: &mut Response,
    buffer: &mut EventStreamBuffer,
    client: &Client,
    post_url: &Url,
    pending: &PendingRequests,
) -> String {
    loop {
        while let Some(frame) = buffer.next_frame() {
            dispatch(server, frame, client, post_url, pending).await;
        }
        match response.chunk().await {
            Ok(Some(chunk)) => buffer.push(&chunk),
            Ok(None) => return "event stream ended".to_string(),
            Err(error) => return format!("event stream failed: {error}"),
        }
    }
}

async fn dispatch(server: &str, frame: SseFrame, client: &Client, post_url: &Url, pending: &PendingRequests) {
    if frame.event_type() != "message" {
        debug!(server = %server, "ignoring '{}' event", frame.event_type());
        return;
    }
    let Some(data) = frame.data else { return };
    let message: Value = match serde_json::from_str(&data) {
        Ok(message) => message,
        Err(_) => {
            debug!(server = %server, "ignoring non-JSON event data: {data}");
            return;
        }
    };

    match rpc::classify(&message) {
        Incoming::Response(id) => pending.resolve(id, message).await,
        Incoming::Request { id, method } => {
            let reply = if method == "ping" {
                rpc::result_response(&id, Value::Object(Default::default()))
            } else {
                rpc::error_response(&id, rpc::METHOD_NOT_FOUND, &format!("method not supported: {method}"))
            };
            let client = client.clone();
            let post_url = post_url.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                if let Err(error) = post_message(&client, &post_url, &reply).await {
                    warn!(server = %server, "failed to answer '{method}': {error}");
                }
            });
        }
        Incoming::Notification(method) => debug!(server = %server, "notification: {method}"),
        Incoming::Unrecognized => debug!(server = %server, "unrecognized message: {data}"),
    }
}
