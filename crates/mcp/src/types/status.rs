//! Connection state and status snapshots.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::client::CircuitStatus;
use crate::config::TransportKind;

/// Connection state of a single server client.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Disconnected,
    /// A transport is being opened and the handshake is in progress.
    Connecting,
    /// Transport open, catalog discovered, last heartbeat or call succeeded.
    Connected,
    /// Still connected, but the most recent heartbeat or call failed.
    Failing,
}

impl ConnectionState {
    /// Get the display icon for this state.
    pub fn icon(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "✗",
            ConnectionState::Connecting => "⏳",
            ConnectionState::Connected => "✓",
            ConnectionState::Failing => "!",
        }
    }

    /// Get the display text for this state.
    pub fn display(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failing => "Failing",
        }
    }

    /// Whether a transport is open and tools are routable.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Failing)
    }
}

/// Status row for one registered server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub enabled: bool,
    pub transport: TransportKind,
    pub tools_count: usize,
    pub resources_count: usize,
    pub prompts_count: usize,
    pub consecutive_failures: u32,
    pub circuit_breaker: CircuitStatus,
}

/// Snapshot returned by `ClientManager::get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub total_servers: usize,
    pub connected_servers: usize,
    /// Enabled servers that are currently not connected.
    pub disconnected_servers: usize,
    pub total_tools: usize,
    pub total_resources: usize,
    pub total_prompts: usize,
    pub heartbeat_running: bool,
    pub servers: BTreeMap<String, ServerStatus>,
}
