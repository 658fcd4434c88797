//! Resource and prompt catalog entries.
//!
//! Like tools, both are converted from the `rmcp` model so callers never depend on it.

use rmcp::model::{Prompt as RmcpPrompt, Resource as RmcpResource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Blobs up to this many base64 characters are inlined when rendering resource contents.
const INLINE_BLOB_LIMIT: usize = 10_000;

/// A resource announced by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub uri: String,
    /// Display name; the uri when the server gives none.
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
}

impl ResourceMetadata {
    pub fn from_rmcp(resource: &RmcpResource) -> Self {
        let name = Some(resource.name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| resource.uri.clone());
        Self {
            uri: resource.uri.clone(),
            name,
            description: resource.description.clone().unwrap_or_default(),
            mime_type: resource.mime_type.clone(),
        }
    }
}

/// One declared argument of a prompt template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// A prompt template announced by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMetadata {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

impl PromptMetadata {
    pub fn from_rmcp(prompt: &RmcpPrompt) -> Self {
        let description = prompt
            .description
            .as_deref()
            .filter(|description| !description.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("MCP prompt: {}", prompt.name));
        let arguments = prompt
            .arguments
            .iter()
            .flatten()
            .map(|argument| PromptArgument {
                name: argument.name.clone(),
                description: argument.description.clone().unwrap_or_default(),
                required: argument.required.unwrap_or(false),
            })
            .collect();

        Self {
            name: prompt.name.clone(),
            description,
            arguments,
        }
    }
}

/// A resource in the manager's routing table, keyed by uri.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedResource {
    pub server: String,
    pub resource: ResourceMetadata,
}

/// A prompt in the manager's routing table, keyed by qualified name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedPrompt {
    pub server: String,
    pub prompt: PromptMetadata,
}

/// Render the `contents` of a `resources/read` result as text.
pub(crate) fn render_resource(result: &Value) -> String {
    let Some(contents) = result.get("contents").and_then(Value::as_array) else {
        return String::new();
    };

    contents
        .iter()
        .map(|content| {
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                text.to_string()
            } else if let Some(blob) = content.get("blob").and_then(Value::as_str) {
                if blob.len() < INLINE_BLOB_LIMIT {
                    format!("[base64]{blob}")
                } else {
                    format!("[binary data: {} bytes]", blob.len() / 4 * 3)
                }
            } else {
                content.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the `messages` of a `prompts/get` result as `[role]: text` paragraphs.
pub(crate) fn render_prompt(result: &Value) -> String {
    let Some(messages) = result.get("messages").and_then(Value::as_array) else {
        return String::new();
    };

    messages
        .iter()
        .map(|message| {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("unknown");
            let text = match message.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(content) => content
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| content.to_string()),
                None => String::new(),
            };
            format!("[{role}]: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
