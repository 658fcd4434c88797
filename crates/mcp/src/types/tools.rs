//! Tool catalog entries and call outcomes.
//!
//! Servers describe their tools via the `tools/list` RPC. The `rmcp` model is converted into a
//! serde-friendly representation so callers (LLM planners, the CLI) never depend on `rmcp`
//! internals.

use std::time::Duration;

use rmcp::model::Tool as RmcpTool;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ToolCallError;

/// Captures the essential metadata for a tool exposed by one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Tool identifier as returned by the server.
    pub name: String,
    /// Optional human-friendly title supplied by the server.
    pub title: Option<String>,
    /// Description of the tool's behavior.
    pub description: String,
    /// JSON schema describing the expected arguments for this tool.
    pub input_schema: Value,
    /// Optional JSON schema describing the structured output produced by the tool.
    pub output_schema: Option<Value>,
    /// Serialized annotations published by the tool (when available).
    pub annotations: Option<Value>,
}

impl ToolMetadata {
    /// Build metadata from the raw RMCP tool payload.
    pub fn from_rmcp(tool: &RmcpTool) -> Self {
        let input_schema = Value::Object(tool.input_schema.as_ref().clone());
        let output_schema = tool.output_schema.as_ref().map(|schema| Value::Object(schema.as_ref().clone()));
        let annotations = tool.annotations.as_ref().and_then(|ann| serde_json::to_value(ann).ok());
        let description = tool
            .description
            .as_ref()
            .map(|d| d.to_string())
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("MCP tool: {}", tool.name));

        Self {
            name: tool.name.to_string(),
            title: tool.title.clone(),
            description,
            input_schema,
            output_schema,
            annotations,
        }
    }
}

impl From<RmcpTool> for ToolMetadata {
    fn from(tool: RmcpTool) -> Self {
        Self::from_rmcp(&tool)
    }
}

/// A catalog entry in the manager's routing table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedTool {
    /// Name of the server owning the tool.
    pub server: String,
    /// Tool metadata as announced by that server.
    pub tool: ToolMetadata,
}

/// Structured outcome of a tool invocation. Produced for every call, successful or not.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    /// Whether the tool executed successfully.
    pub success: bool,
    /// Text rendering of the tool output.
    pub content: Option<String>,
    /// Raw `tools/call` result as returned by the server.
    pub payload: Option<Value>,
    /// Failure reason when `success` is false.
    pub error: Option<ToolCallError>,
    /// Wall time spent on the call, retries included.
    pub duration: Duration,
    /// Number of transport attempts made (0 when rejected before any I/O).
    pub attempts: u32,
    /// Set when the call was rejected by the server's circuit breaker.
    pub circuit_broken: bool,
}

impl ToolCallResult {
    pub(crate) fn success(content: String, payload: Value, duration: Duration, attempts: u32) -> Self {
        Self {
            success: true,
            content: Some(content),
            payload: Some(payload),
            error: None,
            duration,
            attempts,
            circuit_broken: false,
        }
    }

    pub(crate) fn failure(error: ToolCallError, duration: Duration, attempts: u32) -> Self {
        let circuit_broken = matches!(error, ToolCallError::CircuitOpen { .. });
        Self {
            success: false,
            content: None,
            payload: None,
            error: Some(error),
            duration,
            attempts,
            circuit_broken,
        }
    }

    /// Human-readable error message, if the call failed.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Duration in fractional milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Render the `content` array of a `tools/call` result as text.
///
/// Text blocks are joined with newlines; binary blocks are summarized by size.
pub(crate) fn render_content(result: &Value) -> String {
    let Some(blocks) = result.get("content").and_then(Value::as_array) else {
        return String::new();
    };

    blocks
        .iter()
        .map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            Some(kind @ ("image" | "audio")) => {
                let size = block.get("data").and_then(Value::as_str).map(str::len).unwrap_or_default();
                format!("[{kind} data: {size} bytes]")
            }
            Some("resource") => block
                .pointer("/resource/text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| block.to_string()),
            _ => block.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
