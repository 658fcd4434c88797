//! Transports carrying MCP sessions to a server.
//!
//! The set of transports is closed, so they are modelled as an enum rather than a trait
//! object. Stdio and streamable HTTP run on `rmcp`; the legacy SSE transport is hand-rolled.
//! Every variant supports concurrent in-flight requests and bounds each one by its timeout.

mod event_stream;
mod http;
mod rpc;
mod service;
mod sse;
mod stdio;

use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::{ServerConfig, TransportKind};
use crate::protocol::{self, ServerInfo};
use crate::types::{ConnectError, PromptMetadata, ResourceMetadata, ToolMetadata, TransportError};

pub use service::ServiceTransport;
pub use sse::SseTransport;

/// An initialized session with one server.
pub enum Transport {
    Stdio(ServiceTransport),
    Http(ServiceTransport),
    Sse { transport: SseTransport, info: ServerInfo },
}

impl Transport {
    /// Open the transport selected by `config.transport` and complete the `initialize`
    /// handshake, all within `timeout`.
    pub async fn open(config: &ServerConfig, timeout: Duration) -> Result<Self, ConnectError> {
        match config.transport {
            TransportKind::Stdio => stdio::connect(config, timeout).await.map(Transport::Stdio),
            TransportKind::Http => http::connect(config, timeout).await.map(Transport::Http),
            TransportKind::Sse => open_sse(config, timeout).await,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stdio(_) => TransportKind::Stdio,
            Transport::Http(_) => TransportKind::Http,
            Transport::Sse { .. } => TransportKind::Sse,
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.server_info(),
            Transport::Sse { info, .. } => info,
        }
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolMetadata>, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.list_tools(timeout).await,
            Transport::Sse { transport, .. } => protocol::list_tools(transport, timeout).await,
        }
    }

    /// Invoke a tool and return the raw `tools/call` result.
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>, timeout: Duration) -> Result<Value, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.call_tool(name, arguments, timeout).await,
            Transport::Sse { transport, .. } => protocol::call_tool(transport, name, arguments, timeout).await,
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.ping(timeout).await,
            Transport::Sse { transport, .. } => protocol::ping(transport, timeout).await,
        }
    }

    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<ResourceMetadata>, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.list_resources(timeout).await,
            Transport::Sse { transport, .. } => protocol::list_resources(transport, timeout).await,
        }
    }

    pub async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<Value, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.read_resource(uri, timeout).await,
            Transport::Sse { transport, .. } => protocol::read_resource(transport, uri, timeout).await,
        }
    }

    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptMetadata>, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.list_prompts(timeout).await,
            Transport::Sse { transport, .. } => protocol::list_prompts(transport, timeout).await,
        }
    }

    pub async fn get_prompt(&self, name: &str, arguments: Map<String, Value>, timeout: Duration) -> Result<Value, TransportError> {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.get_prompt(name, arguments, timeout).await,
            Transport::Sse { transport, .. } => protocol::get_prompt(transport, name, arguments, timeout).await,
        }
    }

    /// Release the underlying process or connection. Pending requests fail with
    /// [`TransportError::Closed`].
    pub async fn close(&self) {
        match self {
            Transport::Stdio(session) | Transport::Http(session) => session.close().await,
            Transport::Sse { transport, .. } => transport.close().await,
        }
    }
}

async fn open_sse(config: &ServerConfig, timeout: Duration) -> Result<Transport, ConnectError> {
    let handshake = async {
        let transport = SseTransport::connect(config).await?;
        match protocol::initialize(&transport, timeout).await {
            Ok(info) => Ok(Transport::Sse { transport, info }),
            Err(error) => {
                transport.close().await;
                Err(ConnectError::Initialize(error))
            }
        }
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .unwrap_or(Err(ConnectError::Timeout(timeout)))
}
