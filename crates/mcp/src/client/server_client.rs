//! A single server: its transport, catalog, health counters and per-tool statistics.
//!
//! Connection state moves through `Disconnected → Connecting → Connected ⇄ Failing`.
//! Connect and disconnect are serialized by a lifecycle lock; calls only clone the active
//! transport handle, so they never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{CircuitBreaker, CircuitStatus, HealthCheckResult, RetryPolicy};
use crate::config::{ManagerOptions, ServerConfig};
use crate::protocol::ServerInfo;
use crate::transport::Transport;
use crate::types::catalog::{render_prompt, render_resource};
use crate::types::tools::render_content;
use crate::types::{
    ConnectError, ConnectionState, PromptMetadata, ResourceMetadata, ServerStats, ServerStatus, ToolCallError,
    ToolCallResult, ToolCallStats, ToolMetadata, TransportError,
};

#[derive(Default)]
struct Session {
    state: ConnectionState,
    transport: Option<Arc<Transport>>,
    tools: Vec<ToolMetadata>,
    resources: Vec<ResourceMetadata>,
    prompts: Vec<PromptMetadata>,
}

/// Everything a connect discovers.
struct Established {
    transport: Transport,
    tools: Vec<ToolMetadata>,
    resources: Vec<ResourceMetadata>,
    prompts: Vec<PromptMetadata>,
}

/// Consistent view of connection state and catalog, read under one lock.
pub(crate) struct Catalog {
    pub(crate) connected: bool,
    pub(crate) tools: Vec<ToolMetadata>,
    pub(crate) resources: Vec<ResourceMetadata>,
    pub(crate) prompts: Vec<PromptMetadata>,
}

#[derive(Clone, Copy)]
enum Feature {
    Resources,
    Prompts,
}

impl Feature {
    fn label(self) -> &'static str {
        match self {
            Feature::Resources => "resources",
            Feature::Prompts => "prompts",
        }
    }

    fn offered_by(self, info: &ServerInfo) -> bool {
        match self {
            Feature::Resources => info.supports_resources(),
            Feature::Prompts => info.supports_prompts(),
        }
    }
}

/// Client for one configured server.
pub struct ServerClient {
    config: ServerConfig,
    options: RwLock<ManagerOptions>,
    lifecycle: Mutex<()>,
    session: RwLock<Session>,
    stats: Mutex<ServerStats>,
    tool_stats: Mutex<HashMap<String, ToolCallStats>>,
    breaker: Mutex<CircuitBreaker>,
}

impl ServerClient {
    pub fn new(config: ServerConfig, options: ManagerOptions) -> Self {
        let breaker = CircuitBreaker::new(config.name.clone(), options.circuit_breaker.clone());
        Self {
            stats: Mutex::new(ServerStats::new(config.name.clone())),
            config,
            options: RwLock::new(options),
            lifecycle: Mutex::new(()),
            session: RwLock::new(Session::default()),
            tool_stats: Mutex::new(HashMap::new()),
            breaker: Mutex::new(breaker),
        }
    }

    /// Configured server name, unique within a manager.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration this client was created from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Disabled servers are registered but never connected.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.session.read().await.state
    }

    /// True while `Connected` or `Failing`, i.e. a transport is open.
    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Catalog discovered on the last successful connect; empty while disconnected.
    pub async fn tools(&self) -> Vec<ToolMetadata> {
        self.session.read().await.tools.clone()
    }

    pub async fn resources(&self) -> Vec<ResourceMetadata> {
        self.session.read().await.resources.clone()
    }

    pub async fn prompts(&self) -> Vec<PromptMetadata> {
        self.session.read().await.prompts.clone()
    }

    /// Whether the connected server advertised the `resources` capability.
    pub async fn supports_resources(&self) -> bool {
        self.offers(Feature::Resources).await
    }

    /// Whether the connected server advertised the `prompts` capability.
    pub async fn supports_prompts(&self) -> bool {
        self.offers(Feature::Prompts).await
    }

    pub(crate) async fn catalog(&self) -> Catalog {
        let session = self.session.read().await;
        Catalog {
            connected: session.state.is_connected(),
            tools: session.tools.clone(),
            resources: session.resources.clone(),
            prompts: session.prompts.clone(),
        }
    }

    /// Copy of the connection counters.
    pub async fn stats(&self) -> ServerStats {
        self.stats.lock().await.clone()
    }

    /// Per-tool counters keyed by server-local tool name.
    pub async fn tool_stats(&self) -> BTreeMap<String, ToolCallStats> {
        self.tool_stats
            .lock()
            .await
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }

    /// State of the circuit breaker guarding tool calls.
    pub async fn circuit_status(&self) -> CircuitStatus {
        self.breaker.lock().await.status()
    }

    /// Close the circuit and forget recorded failures.
    pub async fn reset_circuit_breaker(&self) {
        self.breaker.lock().await.reset();
        info!(server = %self.name(), "circuit breaker reset");
    }

    /// Status row combining state, catalog sizes, counters and breaker.
    pub async fn status(&self) -> ServerStatus {
        let (state, tools_count, resources_count, prompts_count) = {
            let session = self.session.read().await;
            (session.state, session.tools.len(), session.resources.len(), session.prompts.len())
        };
        ServerStatus {
            state,
            connected: state.is_connected(),
            enabled: self.config.enabled,
            transport: self.config.transport,
            tools_count,
            resources_count,
            prompts_count,
            consecutive_failures: self.stats.lock().await.consecutive_failures,
            circuit_breaker: self.circuit_status().await,
        }
    }

    pub(crate) async fn record_reconnect(&self) {
        self.stats.lock().await.record_reconnect();
    }

    pub(crate) async fn set_options(&self, options: ManagerOptions) {
        self.breaker.lock().await.set_options(options.circuit_breaker.clone());
        *self.options.write().await = options;
    }

    /// Open the transport, run the handshake and fetch the catalog.
    ///
    /// A no-op when already connected. Bounded by the connect timeout.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let timeout = self.options.read().await.effective_connect_timeout();
        self.connect_with_timeout(timeout).await
    }

    /// [`connect`](Self::connect) with an explicit bound on the whole attempt.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut session = self.session.write().await;
            if session.state.is_connected() {
                return Ok(());
            }
            session.state = ConnectionState::Connecting;
        }

        debug!(server = %self.name(), transport = %self.config.transport, "connecting to {}", self.config.address());
        let outcome = match tokio::time::timeout(timeout, self.establish(timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectError::Timeout(timeout)),
        };

        match outcome {
            Ok(established) => {
                let count = established.tools.len();
                {
                    let mut session = self.session.write().await;
                    session.state = ConnectionState::Connected;
                    session.transport = Some(Arc::new(established.transport));
                    session.tools = established.tools;
                    session.resources = established.resources;
                    session.prompts = established.prompts;
                }
                self.stats.lock().await.record_connect();
                self.breaker.lock().await.reset();
                info!(server = %self.name(), tools = count, "connected");
                Ok(())
            }
            Err(error) => {
                self.session.write().await.state = ConnectionState::Disconnected;
                self.stats.lock().await.record_failure();
                warn!(server = %self.name(), "connect failed: {error}");
                Err(error)
            }
        }
    }

    /// [`connect`](Self::connect) under a retry policy. Misconfiguration is not retried.
    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> Result<(), ConnectError> {
        let (outcome, attempts) = policy.run(|_| self.connect(), ConnectError::is_transient).await;
        if outcome.is_err() && attempts > 1 {
            warn!(server = %self.name(), attempts, "giving up on connect");
        }
        outcome
    }

    /// Close the transport and forget the catalog. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.teardown().await {
            info!(server = %self.name(), "disconnected");
        }
    }

    /// Ping the server, bounded by the heartbeat timeout.
    pub async fn check_health(&self) -> HealthCheckResult {
        let Some(transport) = self.active_transport().await else {
            return HealthCheckResult::unhealthy("not connected");
        };
        let timeout = self.options.read().await.heartbeat_timeout;
        let started = Instant::now();

        match transport.ping(timeout).await {
            // A server that answers with an error (e.g. no `ping` support) is still reachable.
            Ok(()) | Err(TransportError::Remote { .. }) => {
                self.stats.lock().await.record_heartbeat();
                self.mark_reachable(&transport).await;
                HealthCheckResult::healthy(started.elapsed().as_millis() as u64)
            }
            Err(error) => {
                self.note_transport_failure(&transport, &error).await;
                HealthCheckResult::unhealthy(error.to_string())
            }
        }
    }

    /// Invoke a server-local tool. Always produces a result; failures are described by it.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> ToolCallResult {
        let started = Instant::now();

        let Some(arguments) = argument_object(arguments) else {
            let error = ToolCallError::InvalidArguments {
                name: tool_name.to_string(),
            };
            return self.finish_call(tool_name, ToolCallResult::failure(error, started.elapsed(), 0)).await;
        };

        let admitted = self.breaker.lock().await.try_acquire();
        if let Err(retry_in) = admitted {
            let error = ToolCallError::CircuitOpen {
                server: self.name().to_string(),
                retry_in,
            };
            return self.finish_call(tool_name, ToolCallResult::failure(error, started.elapsed(), 0)).await;
        }

        let Some(transport) = self.active_transport().await else {
            self.breaker.lock().await.record_failure();
            let error = ToolCallError::NotConnected {
                server: self.name().to_string(),
            };
            return self.finish_call(tool_name, ToolCallResult::failure(error, started.elapsed(), 0)).await;
        };

        let (timeout, policy) = {
            let options = self.options.read().await;
            (self.call_timeout(&options), options.retry_policy())
        };
        let (outcome, attempts) = policy
            .run(
                |_| transport.call_tool(tool_name, arguments.clone(), timeout),
                TransportError::is_transient,
            )
            .await;

        let result = match outcome {
            Ok(payload) if payload.get("isError").and_then(Value::as_bool) == Some(true) => {
                self.mark_answered(&transport).await;
                let message = Some(render_content(&payload))
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| "tool reported an error".to_string());
                let error = ToolCallError::Application {
                    tool: tool_name.to_string(),
                    message,
                };
                ToolCallResult::failure(error, started.elapsed(), attempts)
            }
            Ok(payload) => {
                self.mark_answered(&transport).await;
                ToolCallResult::success(render_content(&payload), payload, started.elapsed(), attempts)
            }
            Err(TransportError::Remote { message, .. }) => {
                self.mark_answered(&transport).await;
                let error = ToolCallError::Application {
                    tool: tool_name.to_string(),
                    message,
                };
                ToolCallResult::failure(error, started.elapsed(), attempts)
            }
            Err(error) => {
                warn!(server = %self.name(), tool = tool_name, attempts, "call failed: {error}");
                self.breaker.lock().await.record_failure();
                self.note_transport_failure(&transport, &error).await;
                ToolCallResult::failure(ToolCallError::Transport(error), started.elapsed(), attempts)
            }
        };
        self.finish_call(tool_name, result).await
    }

    /// Read one resource. The content is the rendered `contents` array.
    pub async fn read_resource(&self, uri: &str) -> ToolCallResult {
        self.request_once(uri, Feature::Resources, render_resource, |transport, timeout| async move {
            transport.read_resource(uri, timeout).await
        })
        .await
    }

    /// Render a prompt template with `arguments` (a JSON object or null).
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> ToolCallResult {
        let Some(arguments) = argument_object(arguments) else {
            let error = ToolCallError::InvalidArguments { name: name.to_string() };
            return ToolCallResult::failure(error, Duration::ZERO, 0);
        };
        self.request_once(name, Feature::Prompts, render_prompt, |transport, timeout| async move {
            transport.get_prompt(name, arguments, timeout).await
        })
        .await
    }

    /// Re-list the server's resources and replace the cached catalog.
    pub async fn fetch_resources(&self) -> Result<Vec<ResourceMetadata>, ToolCallError> {
        let transport = self.require(Feature::Resources).await?;
        let timeout = self.call_timeout(&*self.options.read().await);
        let resources = self
            .list_checked(&transport, transport.list_resources(timeout))
            .await?;
        let mut session = self.session.write().await;
        if is_current(&session, &transport) {
            session.resources = resources.clone();
        }
        Ok(resources)
    }

    /// Re-list the server's prompts and replace the cached catalog.
    pub async fn fetch_prompts(&self) -> Result<Vec<PromptMetadata>, ToolCallError> {
        let transport = self.require(Feature::Prompts).await?;
        let timeout = self.call_timeout(&*self.options.read().await);
        let prompts = self.list_checked(&transport, transport.list_prompts(timeout)).await?;
        let mut session = self.session.write().await;
        if is_current(&session, &transport) {
            session.prompts = prompts.clone();
        }
        Ok(prompts)
    }

    async fn establish(&self, timeout: Duration) -> Result<Established, ConnectError> {
        let transport = Transport::open(&self.config, timeout).await?;
        let tools = match transport.list_tools(timeout).await {
            Ok(tools) => tools,
            Err(error) => {
                transport.close().await;
                return Err(ConnectError::Initialize(error));
            }
        };

        let info = transport.server_info();
        let resources = if info.supports_resources() {
            transport.list_resources(timeout).await.unwrap_or_else(|error| {
                warn!(server = %self.name(), "resources/list failed: {error}");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let prompts = if info.supports_prompts() {
            transport.list_prompts(timeout).await.unwrap_or_else(|error| {
                warn!(server = %self.name(), "prompts/list failed: {error}");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(Established {
            transport,
            tools,
            resources,
            prompts,
        })
    }

    fn call_timeout(&self, options: &ManagerOptions) -> Duration {
        self.config.call_timeout.unwrap_or(options.call_timeout)
    }

    async fn active_transport(&self) -> Option<Arc<Transport>> {
        let session = self.session.read().await;
        if session.state.is_connected() {
            session.transport.clone()
        } else {
            None
        }
    }

    async fn offers(&self, feature: Feature) -> bool {
        let session = self.session.read().await;
        session
            .transport
            .as_ref()
            .is_some_and(|transport| session.state.is_connected() && feature.offered_by(transport.server_info()))
    }

    /// The active transport, provided the server offers `feature`.
    async fn require(&self, feature: Feature) -> Result<Arc<Transport>, ToolCallError> {
        let transport = self.active_transport().await.ok_or_else(|| ToolCallError::NotConnected {
            server: self.name().to_string(),
        })?;
        if !feature.offered_by(transport.server_info()) {
            return Err(ToolCallError::Unsupported {
                server: self.name().to_string(),
                feature: feature.label(),
            });
        }
        Ok(transport)
    }

    async fn list_checked<T>(
        &self,
        transport: &Arc<Transport>,
        listing: impl Future<Output = Result<Vec<T>, TransportError>>,
    ) -> Result<Vec<T>, ToolCallError> {
        match listing.await {
            Ok(items) => {
                self.mark_reachable(transport).await;
                Ok(items)
            }
            Err(error @ TransportError::Remote { .. }) => {
                self.mark_reachable(transport).await;
                Err(ToolCallError::Transport(error))
            }
            Err(error) => {
                self.note_transport_failure(transport, &error).await;
                Err(ToolCallError::Transport(error))
            }
        }
    }

    /// One request outside the tool path: no retries and no circuit breaker.
    async fn request_once<F, Fut>(
        &self,
        subject: &str,
        feature: Feature,
        render: fn(&Value) -> String,
        request: F,
    ) -> ToolCallResult
    where
        F: FnOnce(Arc<Transport>, Duration) -> Fut,
        Fut: Future<Output = Result<Value, TransportError>>,
    {
        let started = Instant::now();
        let transport = match self.require(feature).await {
            Ok(transport) => transport,
            Err(error) => return ToolCallResult::failure(error, started.elapsed(), 0),
        };
        let timeout = self.call_timeout(&*self.options.read().await);

        match request(Arc::clone(&transport), timeout).await {
            Ok(payload) => {
                self.mark_reachable(&transport).await;
                ToolCallResult::success(render(&payload), payload, started.elapsed(), 1)
            }
            Err(TransportError::Remote { message, .. }) => {
                self.mark_reachable(&transport).await;
                let error = ToolCallError::Application {
                    tool: subject.to_string(),
                    message,
                };
                ToolCallResult::failure(error, started.elapsed(), 1)
            }
            Err(error) => {
                warn!(server = %self.name(), subject, "{} request failed: {error}", feature.label());
                self.note_transport_failure(&transport, &error).await;
                ToolCallResult::failure(ToolCallError::Transport(error), started.elapsed(), 1)
            }
        }
    }

    /// Record one completed call in the tool's counters.
    async fn finish_call(&self, tool_name: &str, result: ToolCallResult) -> ToolCallResult {
        self.tool_stats
            .lock()
            .await
            .entry(tool_name.to_string())
            .or_insert_with(|| ToolCallStats::new(tool_name))
            .record_call(result.success, result.duration, result.error_message());
        result
    }

    /// The server answered a call, successfully or with an application error.
    async fn mark_answered(&self, transport: &Arc<Transport>) {
        self.breaker.lock().await.record_success();
        self.mark_reachable(transport).await;
    }

    async fn mark_reachable(&self, transport: &Arc<Transport>) {
        self.stats.lock().await.record_success();
        let mut session = self.session.write().await;
        if session.state == ConnectionState::Failing && is_current(&session, transport) {
            session.state = ConnectionState::Connected;
            info!(server = %self.name(), "recovered");
        }
    }

    /// Count a transport-level failure; disconnect once the streak reaches the limit.
    async fn note_transport_failure(&self, transport: &Arc<Transport>, error: &TransportError) {
        let failures = {
            let mut stats = self.stats.lock().await;
            stats.record_failure();
            stats.consecutive_failures
        };
        let limit = self.options.read().await.max_reconnect_attempts;

        if failures >= limit {
            let _lifecycle = self.lifecycle.lock().await;
            if is_current(&*self.session.read().await, transport) {
                warn!(server = %self.name(), failures, "disconnecting after repeated failures: {error}");
                self.teardown().await;
            }
            return;
        }

        let mut session = self.session.write().await;
        if session.state == ConnectionState::Connected && is_current(&session, transport) {
            session.state = ConnectionState::Failing;
            warn!(server = %self.name(), failures, "server failing: {error}");
        }
    }

    /// Drop the session. Caller holds the lifecycle lock. Returns whether it was connected.
    async fn teardown(&self) -> bool {
        let (transport, was_connected) = {
            let mut session = self.session.write().await;
            let was_connected = session.state.is_connected();
            session.state = ConnectionState::Disconnected;
            session.tools.clear();
            session.resources.clear();
            session.prompts.clear();
            (session.transport.take(), was_connected)
        };
        if was_connected {
            self.stats.lock().await.record_disconnect();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        was_connected
    }
}

fn is_current(session: &Session, transport: &Arc<Transport>) -> bool {
    session.transport.as_ref().is_some_and(|current| Arc::ptr_eq(current, transport))
}

/// Call arguments must be a JSON object; null means none.
fn argument_object(arguments: Value) -> Option<Map<String, Value>> {
    match arguments {
        Value::Null => Some(Map::new()),
        Value::Object(map) => Some(map),
        _ => None,
    }
}
