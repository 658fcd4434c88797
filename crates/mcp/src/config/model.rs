//! Data models for manager options and server configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::RetryPolicy;

/// Options applied to a [`ClientManager`](crate::client::ClientManager) via `configure`.
///
/// Durations are expressed in (fractional) seconds when (de)serialized. Unknown keys are
/// ignored so that host applications can keep unrelated settings in the same table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Prefix of every qualified tool name (`{prefix}_{server}_{tool}`).
    pub tool_prefix: String,
    /// Upper bound for a single transport attempt of a tool call.
    #[serde(with = "seconds")]
    pub call_timeout: Duration,
    /// Upper bound for opening a transport and discovering its catalog. Falls back to
    /// `call_timeout` when unset.
    #[serde(with = "optional_seconds", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    /// Retries after the first attempt for transient failures.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(with = "seconds")]
    pub retry_interval: Duration,
    pub heartbeat_enabled: bool,
    #[serde(with = "seconds")]
    pub heartbeat_interval: Duration,
    /// Upper bound for a single heartbeat ping, and for a heartbeat-driven reconnect.
    #[serde(with = "seconds")]
    pub heartbeat_timeout: Duration,
    /// Stretch the interval of steadily healthy servers and shorten it for unreachable ones.
    pub heartbeat_adaptive: bool,
    /// Cap of an adaptive interval, as a multiple of `heartbeat_interval`.
    pub heartbeat_max_multiplier: f64,
    pub auto_reconnect: bool,
    /// Consecutive failures after which a client is disconnected.
    pub max_reconnect_attempts: u32,
    pub circuit_breaker: CircuitBreakerOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            tool_prefix: "mcp".to_string(),
            call_timeout: Duration::from_secs(60),
            connect_timeout: None,
            retry_attempts: 3,
            retry_interval: Duration::from_secs(5),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(10),
            heartbeat_adaptive: true,
            heartbeat_max_multiplier: 3.0,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            circuit_breaker: CircuitBreakerOptions::default(),
        }
    }
}

impl ManagerOptions {
    /// Effective connect timeout.
    pub fn effective_connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(self.call_timeout)
    }

    /// Bound on a reconnect attempted by the heartbeat.
    pub fn heartbeat_reconnect_timeout(&self) -> Duration {
        self.heartbeat_timeout.min(self.effective_connect_timeout())
    }

    /// Retry policy derived from `retry_attempts` and `retry_interval`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_interval)
    }
}

/// Per-server fast-fail guard settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    pub enabled: bool,
    /// Consecutive transport failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is admitted.
    #[serde(with = "seconds")]
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned subprocess speaking newline-delimited JSON-RPC over stdin/stdout.
    Stdio,
    /// Streamable HTTP: one POST per message.
    #[serde(alias = "streamable_http", alias = "streamable-http", alias = "streamableHttp")]
    Http,
    /// Legacy HTTP+SSE: persistent event stream plus a POST endpoint.
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

/// Identity and connection parameters for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    /// Unique name within a manager.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub enabled: bool,
    pub transport: TransportKind,
    /// Executable for stdio transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Endpoint for http and sse transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    /// Overrides the manager's `call_timeout` for this server.
    #[serde(serialize_with = "optional_seconds::serialize", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
}

impl ServerConfig {
    fn with_transport(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            transport,
            command: None,
            args: Vec::new(),
            env: IndexMap::new(),
            cwd: None,
            url: None,
            headers: IndexMap::new(),
            call_timeout: None,
        }
    }

    /// A server reached by spawning `command`.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::with_transport(name, TransportKind::Stdio)
        }
    }

    /// A streamable HTTP server.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::with_transport(name, TransportKind::Http)
        }
    }

    /// A legacy HTTP+SSE server.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::with_transport(name, TransportKind::Sse)
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Address shown in logs: the url, or the command line.
    pub fn address(&self) -> String {
        match self.transport {
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_default()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            TransportKind::Http | TransportKind::Sse => self.url.clone().unwrap_or_default(),
        }
    }
}

/// Wire shape accepted for a server entry. Supports the `type` alias, `disabled`,
/// and inferring the transport from `command`/`url`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct RawServerConfig {
    #[serde(default)]
    name: String,
    enabled: Option<bool>,
    disabled: Option<bool>,
    #[serde(alias = "type")]
    transport: Option<TransportKind>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: IndexMap<String, String>,
    cwd: Option<PathBuf>,
    #[serde(alias = "baseUrl", alias = "base_url")]
    url: Option<String>,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default, with = "optional_seconds", alias = "callTimeout")]
    call_timeout: Option<Duration>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        let transport = match (raw.transport, &raw.command, &raw.url) {
            (Some(kind), _, _) => kind,
            (None, Some(_), _) => TransportKind::Stdio,
            (None, None, Some(_)) => TransportKind::Http,
            (None, None, None) => {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "server '{}' needs either 'command' (stdio) or 'url' (http/sse)",
                        raw.name
                    ),
                });
            }
        };
        let enabled = raw.enabled.unwrap_or(!raw.disabled.unwrap_or(false));

        Ok(Self {
            name: raw.name,
            enabled,
            transport,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            cwd: raw.cwd,
            url: raw.url,
            headers: raw.headers,
            call_timeout: raw.call_timeout,
        })
    }
}

/// Configuration file contents: manager settings plus named servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolmuxConfig {
    #[serde(default)]
    pub settings: ManagerOptions,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: IndexMap<String, ServerConfig>,
}

impl ToolmuxConfig {
    /// Server configurations in file order, named after their map keys.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.mcp_servers
            .iter()
            .map(|(name, server)| ServerConfig {
                name: name.clone(),
                ..server.clone()
            })
            .collect()
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] crate::config::ValidationError),

    #[error("Configuration error: {message}")]
    Invalid { message: String },
}

pub(crate) mod seconds {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}")))
    }
}

pub(crate) mod optional_seconds {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}")))
            })
            .transpose()
    }
}
