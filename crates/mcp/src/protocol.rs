//! MCP methods spoken over the legacy SSE transport, plus what every transport reports about
//! the server after `initialize`.
//!
//! Stdio and streamable HTTP sessions go through `rmcp`; SSE exchanges raw JSON-RPC and
//! parses catalogs leniently, skipping entries it cannot understand.

use std::time::Duration;

use rmcp::model::{InitializeResult, Prompt as RmcpPrompt, Resource as RmcpResource, Tool as RmcpTool};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::transport::SseTransport;
use crate::types::{PromptMetadata, ResourceMetadata, ToolMetadata, TransportError};

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
pub const RESOURCES_LIST: &str = "resources/list";
pub const RESOURCES_READ: &str = "resources/read";
pub const PROMPTS_LIST: &str = "prompts/list";
pub const PROMPTS_GET: &str = "prompts/get";
pub const PING: &str = "ping";

/// Upper bound on pages of any `*/list` method, guarding against servers that never stop paginating.
pub(crate) const MAX_LIST_PAGES: usize = 100;

/// What the server reported about itself during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerInfo {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: Value,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn supports_resources(&self) -> bool {
        self.capabilities.get("resources").is_some_and(|value| !value.is_null())
    }

    pub fn supports_prompts(&self) -> bool {
        self.capabilities.get("prompts").is_some_and(|value| !value.is_null())
    }
}

impl From<&InitializeResult> for ServerInfo {
    fn from(result: &InitializeResult) -> Self {
        Self {
            protocol_version: result.protocol_version.to_string(),
            server_info: Implementation {
                name: result.server_info.name.clone(),
                version: result.server_info.version.clone(),
            },
            capabilities: serde_json::to_value(&result.capabilities).unwrap_or_default(),
            instructions: result.instructions.clone(),
        }
    }
}

/// Perform the `initialize` request followed by the `initialized` notification.
pub(crate) async fn initialize(transport: &SseTransport, timeout: Duration) -> Result<ServerInfo, TransportError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": "toolmux", "version": env!("CARGO_PKG_VERSION") },
    });
    let result = transport.send_request(INITIALIZE, Some(params), timeout).await?;
    let info: ServerInfo =
        serde_json::from_value(result).map_err(|error| TransportError::Malformed(format!("initialize result: {error}")))?;
    debug!(
        "initialized {} {} (protocol {})",
        info.server_info.name, info.server_info.version, info.protocol_version
    );

    transport.send_notification(INITIALIZED, None).await?;
    Ok(info)
}

pub(crate) async fn list_tools(transport: &SseTransport, timeout: Duration) -> Result<Vec<ToolMetadata>, TransportError> {
    let tools = list_all(transport, TOOLS_LIST, "tools", timeout).await?;
    Ok(tools.iter().filter_map(parse_tool).collect())
}

pub(crate) async fn list_resources(
    transport: &SseTransport,
    timeout: Duration,
) -> Result<Vec<ResourceMetadata>, TransportError> {
    let resources = list_all(transport, RESOURCES_LIST, "resources", timeout).await?;
    Ok(resources
        .iter()
        .filter_map(|entry| parse_entry::<RmcpResource>("resource", entry))
        .map(|resource| ResourceMetadata::from_rmcp(&resource))
        .collect())
}

pub(crate) async fn list_prompts(transport: &SseTransport, timeout: Duration) -> Result<Vec<PromptMetadata>, TransportError> {
    let prompts = list_all(transport, PROMPTS_LIST, "prompts", timeout).await?;
    Ok(prompts
        .iter()
        .filter_map(|entry| parse_entry::<RmcpPrompt>("prompt", entry))
        .map(|prompt| PromptMetadata::from_rmcp(&prompt))
        .collect())
}

/// Invoke a tool and return the raw `tools/call` result.
pub(crate) async fn call_tool(
    transport: &SseTransport,
    name: &str,
    arguments: Map<String, Value>,
    timeout: Duration,
) -> Result<Value, TransportError> {
    let params = json!({ "name": name, "arguments": arguments });
    transport.send_request(TOOLS_CALL, Some(params), timeout).await
}

pub(crate) async fn read_resource(transport: &SseTransport, uri: &str, timeout: Duration) -> Result<Value, TransportError> {
    transport.send_request(RESOURCES_READ, Some(json!({ "uri": uri })), timeout).await
}

pub(crate) async fn get_prompt(
    transport: &SseTransport,
    name: &str,
    arguments: Map<String, Value>,
    timeout: Duration,
) -> Result<Value, TransportError> {
    let params = json!({ "name": name, "arguments": arguments });
    transport.send_request(PROMPTS_GET, Some(params), timeout).await
}

/// Liveness check.
pub(crate) async fn ping(transport: &SseTransport, timeout: Duration) -> Result<(), TransportError> {
    transport.send_request(PING, None, timeout).await.map(|_| ())
}

/// Collect the `key` array of every page of `method`, following `nextCursor`.
async fn list_all(transport: &SseTransport, method: &str, key: &str, timeout: Duration) -> Result<Vec<Value>, TransportError> {
    let mut entries = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
        let mut result = transport.send_request(method, params, timeout).await?;

        match result.get_mut(key).map(Value::take) {
            Some(Value::Array(page)) => entries.extend(page),
            _ => return Err(TransportError::Malformed(format!("{method} result lacks a '{key}' array"))),
        }

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|next| !next.is_empty())
            .map(str::to_string);
        if cursor.is_none() {
            return Ok(entries);
        }
    }

    warn!("{method} pagination exceeded {MAX_LIST_PAGES} pages, keeping what was fetched");
    Ok(entries)
}

/// Convert one tool entry, filling in a missing input schema.
fn parse_tool(entry: &Value) -> Option<ToolMetadata> {
    let mut entry = entry.clone();
    if let Value::Object(map) = &mut entry
        && !map.get("inputSchema").is_some_and(Value::is_object)
    {
        map.insert("inputSchema".to_string(), json!({ "type": "object" }));
    }
    parse_entry::<RmcpTool>("tool", &entry).map(|tool| ToolMetadata::from_rmcp(&tool))
}

fn parse_entry<T: DeserializeOwned>(kind: &str, entry: &Value) -> Option<T> {
    match T::deserialize(entry) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn!("skipping malformed {kind} entry: {error}");
            None
        }
    }
}
