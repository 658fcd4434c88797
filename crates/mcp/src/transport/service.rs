//! Sessions driven by `rmcp`: the stdio and streamable HTTP transports.
//!
//! `rmcp` owns the wire (framing, id correlation, answering server pings). Every request made
//! here is bounded by one `tokio::time::timeout` covering both the write and the wait for the
//! response, so a peer that stops reading cannot hold a caller longer than its timeout.

use std::future::Future;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, ClientRequest, GetPromptRequestParams, PaginatedRequestParams, PingRequest,
    ReadResourceRequestParams,
};
use rmcp::service::{RunningService, ServiceExt as _};
use rmcp::transport::IntoTransport;
use rmcp::{Peer, RoleClient, ServiceError};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::{self, MAX_LIST_PAGES, ServerInfo};
use crate::types::{ConnectError, PromptMetadata, ResourceMetadata, ToolMetadata, TransportError};

/// How long `close` waits for the session task (and the HTTP session `DELETE`) to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An initialized `rmcp` client session.
pub struct ServiceTransport {
    server: String,
    peer: Peer<RoleClient>,
    info: ServerInfo,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl ServiceTransport {
    /// Run the `initialize` handshake over any `rmcp` client transport.
    pub(crate) async fn handshake<T, E, A>(server: &str, transport: T, timeout: Duration) -> Result<Self, ConnectError>
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let service = match tokio::time::timeout(timeout, ().serve(transport)).await {
            Ok(Ok(service)) => service,
            Ok(Err(error)) => {
                return Err(ConnectError::Handshake {
                    message: error.to_string(),
                });
            }
            Err(_) => return Err(ConnectError::Timeout(timeout)),
        };

        let info = service.peer_info().map(ServerInfo::from).unwrap_or_default();
        debug!(
            server,
            "server reports {} {} (protocol {})", info.server_info.name, info.server_info.version, info.protocol_version
        );
        Ok(Self {
            server: server.to_string(),
            peer: service.peer().clone(),
            info,
            service: Mutex::new(Some(service)),
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolMetadata>, TransportError> {
        let tools = self
            .paginate(protocol::TOOLS_LIST, timeout, |params| async move {
                let page = self.peer.list_tools(params).await?;
                Ok((page.tools, page.next_cursor))
            })
            .await?;
        Ok(tools.iter().map(ToolMetadata::from_rmcp).collect())
    }

    /// Invoke a tool and return the `tools/call` result as JSON.
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>, timeout: Duration) -> Result<Value, TransportError> {
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: Some(arguments),
            task: None,
        };
        let result = self.request(protocol::TOOLS_CALL, timeout, self.peer.call_tool(params)).await?;
        to_json(&result)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        let ping = ClientRequest::PingRequest(PingRequest::default());
        self.request(protocol::PING, timeout, self.peer.send_request(ping)).await.map(|_| ())
    }

    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<ResourceMetadata>, TransportError> {
        let resources = self
            .paginate(protocol::RESOURCES_LIST, timeout, |params| async move {
                let page = self.peer.list_resources(params).await?;
                Ok((page.resources, page.next_cursor))
            })
            .await?;
        Ok(resources.iter().map(ResourceMetadata::from_rmcp).collect())
    }

    pub async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<Value, TransportError> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let result = self.request(protocol::RESOURCES_READ, timeout, self.peer.read_resource(params)).await?;
        to_json(&result)
    }

    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptMetadata>, TransportError> {
        let prompts = self
            .paginate(protocol::PROMPTS_LIST, timeout, |params| async move {
                let page = self.peer.list_prompts(params).await?;
                Ok((page.prompts, page.next_cursor))
            })
            .await?;
        Ok(prompts.iter().map(PromptMetadata::from_rmcp).collect())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Map<String, Value>, timeout: Duration) -> Result<Value, TransportError> {
        let params = GetPromptRequestParams {
            meta: None,
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let result = self.request(protocol::PROMPTS_GET, timeout, self.peer.get_prompt(params)).await?;
        to_json(&result)
    }

    /// Cancel the session and release the child process or HTTP session.
    pub async fn close(&self) {
        let Some(mut service) = self.service.lock().await.take() else {
            return;
        };
        match service.close_with_timeout(CLOSE_TIMEOUT).await {
            Ok(Some(reason)) => debug!(server = %self.server, ?reason, "session closed"),
            Ok(None) => warn!(server = %self.server, "session did not close within {CLOSE_TIMEOUT:?}"),
            Err(error) => warn!(server = %self.server, "session task failed: {error}"),
        }
    }

    async fn request<T>(
        &self,
        method: &str,
        timeout: Duration,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome.map_err(|error| service_error(method, timeout, error)),
            Err(_) => Err(TransportError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Follow `nextCursor` pagination. Each page gets the full timeout.
    async fn paginate<T, F, Fut>(&self, method: &str, timeout: Duration, mut fetch: F) -> Result<Vec<T>, TransportError>
    where
        F: FnMut(Option<PaginatedRequestParams>) -> Fut,
        Fut: Future<Output = Result<(Vec<T>, Option<String>), ServiceError>>,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                meta: None,
                cursor: Some(cursor),
            });
            let (page, next) = self.request(method, timeout, fetch(params)).await?;
            items.extend(page);
            cursor = next.filter(|next| !next.is_empty());
            if cursor.is_none() {
                return Ok(items);
            }
        }
        warn!(server = %self.server, "{method} pagination exceeded {MAX_LIST_PAGES} pages, keeping what was fetched");
        Ok(items)
    }
}

fn service_error(method: &str, timeout: Duration, error: ServiceError) -> TransportError {
    match error {
        ServiceError::McpError(error) => TransportError::Remote {
            code: i64::from(error.code.0),
            message: error.message.into_owned(),
        },
        ServiceError::TransportClosed => TransportError::closed("session closed"),
        ServiceError::Timeout { .. } => TransportError::Timeout {
            method: method.to_string(),
            timeout,
        },
        ServiceError::Cancelled { reason } => {
            TransportError::closed(reason.unwrap_or_else(|| format!("'{method}' was cancelled")))
        }
        ServiceError::UnexpectedResponse => TransportError::Malformed(format!("unexpected response to '{method}'")),
        other => TransportError::Request(other.to_string()),
    }
}

fn to_json(result: &impl Serialize) -> Result<Value, TransportError> {
    serde_json::to_value(result).map_err(|error| TransportError::Malformed(error.to_string()))
}
