//! Multi-server Model Context Protocol (MCP) client manager.
//!
//! This crate connects to any number of MCP tool servers over stdio, streamable HTTP or
//! legacy HTTP+SSE, exposes their tools and prompts under qualified names and their
//! resources by uri, routes calls to the owning server with retries and a circuit breaker,
//! and keeps connections healthy with a heartbeat.
//!
//! ```no_run
//! use serde_json::json;
//! use toolmux_mcp::{ClientManager, ManagerOptions, ServerConfig};
//!
//! # async fn run() {
//! let manager = ClientManager::new(ManagerOptions::default());
//! manager.add_server(ServerConfig::http("cook", "https://example.com/mcp")).await;
//! let result = manager.call_tool("mcp_cook_search", json!({ "query": "noodles" })).await;
//! println!("{:?}", result.content);
//! manager.shutdown().await;
//! # }
//! ```

pub mod client;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{ClientManager, ManagerEvent, RetryPolicy, ServerClient, qualified_name};
pub use config::{ConfigError, ManagerOptions, ServerConfig, ToolmuxConfig, TransportKind};
pub use types::{
    ConnectError, ConnectionState, ManagerStatus, PromptMetadata, RegistryError, ResourceMetadata, StatsSnapshot,
    ToolCallError, ToolCallResult, ToolMetadata, TransportError,
};
