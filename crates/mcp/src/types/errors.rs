//! Error types for MCP connections, calls and the client registry.

use std::time::Duration;

use thiserror::Error;

use crate::config::{TransportKind, ValidationError};

/// Failure to establish a transport or complete the MCP handshake.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("missing command for stdio transport")]
    MissingCommand,

    #[error("missing url for {transport} transport")]
    MissingUrl { transport: TransportKind },

    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("handshake failed: {message}")]
    Handshake { message: String },

    #[error("initialization failed: {0}")]
    Initialize(#[from] TransportError),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Whether retrying the connection could plausibly succeed.
    ///
    /// Misconfiguration (missing command or url) never heals on its own.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ConnectError::MissingCommand | ConnectError::MissingUrl { .. } | ConnectError::InvalidUrl { .. }
        )
    }
}

/// Failure while exchanging messages over an otherwise open transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("transport closed: {reason}")]
    Closed { reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl TransportError {
    /// Transient failures are eligible for the retry policy and count against
    /// connection health. Malformed payloads and remote JSON-RPC errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. }
            | TransportError::Closed { .. }
            | TransportError::Io(_)
            | TransportError::Request(_) => true,
            TransportError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            TransportError::Malformed(_) | TransportError::Remote { .. } => false,
        }
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        TransportError::Closed { reason: reason.into() }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TransportError::Http {
                status: status.as_u16(),
                body: error.to_string(),
            },
            None => TransportError::Request(error.to_string()),
        }
    }
}

/// Reason a [`ToolCallResult`](crate::types::ToolCallResult) reports failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("tool '{name}' not found")]
    ToolNotFound { name: String },

    #[error("resource '{uri}' not found")]
    ResourceNotFound { uri: String },

    #[error("prompt '{name}' not found")]
    PromptNotFound { name: String },

    #[error("server '{name}' is not registered")]
    ServerNotFound { name: String },

    #[error("server '{server}' does not offer {feature}")]
    Unsupported { server: String, feature: &'static str },

    #[error("arguments for '{name}' must be a JSON object")]
    InvalidArguments { name: String },

    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    #[error("circuit open for server '{server}', retry in {retry_in:?}")]
    CircuitOpen { server: String, retry_in: Duration },

    #[error("client manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered, but reported the call (or read) as failed.
    #[error("'{tool}' failed: {message}")]
    Application { tool: String, message: String },
}

/// Errors from registering or removing servers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server already registered: {name}")]
    DuplicateServer { name: String },

    #[error("server not found: {name}")]
    ServerNotFound { name: String },

    #[error("client manager is shut down")]
    ShutDown,

    #[error("invalid server configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
}
