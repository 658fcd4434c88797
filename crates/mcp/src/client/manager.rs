//! ClientManager: registry, routing and lifecycle management for many servers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::heartbeat::{Heartbeat, HeartbeatOutcome};
use super::server_client::ServerClient;
use crate::config::{ManagerOptions, ServerConfig, validate_server};
use crate::types::{
    ConnectionState, GlobalStats, ManagerStatus, RegistryError, RoutedPrompt, RoutedResource, RoutedTool, StatsSnapshot,
    ToolCallError, ToolCallResult, ToolStatsSnapshot,
};

/// Lifecycle events emitted by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    ServerAdded { server: String },
    ServerRemoved { server: String },
    /// The server's catalog became routable.
    Connected { server: String, tools: usize },
    /// The server's catalog was withdrawn from routing.
    Disconnected { server: String },
    /// An explicit or heartbeat-driven reconnect succeeded.
    Reconnected { server: String },
    HeartbeatFailed { server: String, error: String },
}

/// Build the routing key of a server-local tool or prompt.
///
/// Names that already carry the `{prefix}_{server}_` stem are used verbatim.
pub fn qualified_name(prefix: &str, server: &str, tool: &str) -> String {
    let stem = format!("{prefix}_{server}_");
    if tool.starts_with(&stem) {
        tool.to_string()
    } else {
        format!("{stem}{tool}")
    }
}

#[derive(Default)]
struct Registry {
    clients: IndexMap<String, Arc<ServerClient>>,
    routes: BTreeMap<String, RoutedTool>,
    /// Resources keyed by uri.
    resources: BTreeMap<String, RoutedResource>,
    /// Prompts keyed by qualified name.
    prompts: BTreeMap<String, RoutedPrompt>,
    /// Servers whose catalog is currently part of the routing tables.
    routed: HashSet<String>,
}

impl Registry {
    fn withdraw(&mut self, server: &str) {
        self.routes.retain(|_, route| route.server != server);
        self.resources.retain(|_, route| route.server != server);
        self.prompts.retain(|_, route| route.server != server);
    }

    fn owns(&self, client: &Arc<ServerClient>) -> bool {
        self.clients
            .get(client.name())
            .is_some_and(|current| Arc::ptr_eq(current, client))
    }
}

pub(crate) struct ManagerInner {
    options: RwLock<ManagerOptions>,
    registry: RwLock<Registry>,
    global: Mutex<GlobalStats>,
    heartbeat: Mutex<Option<Heartbeat>>,
    accepting: AtomicBool,
    event_tx: broadcast::Sender<ManagerEvent>,
}

/// Process-scoped handle to the set of managed servers. Cloning is cheap; all clones share
/// the same registry.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl ClientManager {
    pub fn new(options: ManagerOptions) -> Self {
        let (event_tx, _rx) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                options: RwLock::new(options),
                registry: RwLock::new(Registry::default()),
                global: Mutex::new(GlobalStats::default()),
                heartbeat: Mutex::new(None),
                accepting: AtomicBool::new(true),
                event_tx,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// Subscribe to lifecycle events emitted by this manager.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Copy of the options currently in force.
    pub async fn options(&self) -> ManagerOptions {
        self.inner.options.read().await.clone()
    }

    /// Replace the options. Re-opens a manager that was shut down.
    pub async fn configure(&self, options: ManagerOptions) {
        let prefix_changed = {
            let mut current = self.inner.options.write().await;
            let changed = current.tool_prefix != options.tool_prefix;
            *current = options.clone();
            changed
        };
        if self.is_heartbeat_running().await {
            warn!("options changed while the heartbeat is running; new intervals apply from each server's next check");
        }

        for client in self.clients().await {
            client.set_options(options.clone()).await;
        }
        if prefix_changed {
            info!(prefix = %options.tool_prefix, "tool prefix changed, rebuilding routes");
            let mut registry = self.inner.registry.write().await;
            let routes = std::mem::take(&mut registry.routes);
            registry.routes = routes
                .into_values()
                .map(|route| {
                    (
                        qualified_name(&options.tool_prefix, &route.server, &route.tool.name),
                        route,
                    )
                })
                .collect();
            let prompts = std::mem::take(&mut registry.prompts);
            registry.prompts = prompts
                .into_values()
                .map(|route| {
                    (
                        qualified_name(&options.tool_prefix, &route.server, &route.prompt.name),
                        route,
                    )
                })
                .collect();
        }
        self.inner.accepting.store(true, Ordering::SeqCst);
    }

    /// Register a server, connecting it unless it is disabled. Returns false for duplicates,
    /// invalid configurations and a shut-down manager.
    pub async fn add_server(&self, config: ServerConfig) -> bool {
        let name = config.name.clone();
        match self.register_server(config).await {
            Ok(()) => true,
            Err(error) => {
                warn!(server = %name, "server not added: {error}");
                false
            }
        }
    }

    /// Typed form of [`add_server`](Self::add_server).
    ///
    /// A failed initial connect is not an error: the server stays registered and the heartbeat
    /// keeps trying to reach it.
    pub async fn register_server(&self, config: ServerConfig) -> Result<(), RegistryError> {
        if !self.is_accepting() {
            return Err(RegistryError::ShutDown);
        }
        validate_server(&config)?;

        let options = self.options().await;
        let name = config.name.clone();
        let client = Arc::new(ServerClient::new(config, options.clone()));
        {
            let mut registry = self.inner.registry.write().await;
            if registry.clients.contains_key(&name) {
                return Err(RegistryError::DuplicateServer { name });
            }
            registry.clients.insert(name.clone(), Arc::clone(&client));
        }
        info!(
            server = %name,
            transport = %client.config().transport,
            enabled = client.is_enabled(),
            "server registered"
        );
        self.emit(ManagerEvent::ServerAdded { server: name.clone() });

        if !client.is_enabled() {
            return Ok(());
        }

        match client.connect_with_retry(options.retry_policy()).await {
            Ok(()) if !self.is_registered(&client).await => {
                debug!(server = %name, "removed while connecting");
                client.disconnect().await;
            }
            Ok(()) => self.sync_routes(&client).await,
            Err(error) => warn!(server = %name, "initial connect failed, will retry on heartbeat: {error}"),
        }
        Ok(())
    }

    /// Disconnect and discard a server. Returns false when the name is unknown.
    pub async fn remove_server(&self, name: &str) -> bool {
        self.unregister_server(name).await.is_ok()
    }

    /// Typed form of [`remove_server`](Self::remove_server).
    pub async fn unregister_server(&self, name: &str) -> Result<(), RegistryError> {
        let client = {
            let mut registry = self.inner.registry.write().await;
            let client = registry
                .clients
                .shift_remove(name)
                .ok_or_else(|| RegistryError::ServerNotFound { name: name.to_string() })?;
            registry.withdraw(name);
            registry.routed.remove(name);
            client
        };
        client.disconnect().await;
        info!(server = %name, "server removed");
        self.emit(ManagerEvent::ServerRemoved { server: name.to_string() });
        Ok(())
    }

    /// Drop the current session of a server and connect again under the retry policy.
    pub async fn reconnect_server(&self, name: &str) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let Some(client) = self.server(name).await else {
            return false;
        };

        client.disconnect().await;
        self.sync_routes(&client).await;

        let policy = self.options().await.retry_policy();
        match client.connect_with_retry(policy).await {
            Ok(()) => {
                client.record_reconnect().await;
                self.sync_routes(&client).await;
                info!(server = %name, "reconnected");
                self.emit(ManagerEvent::Reconnected { server: name.to_string() });
                true
            }
            Err(error) => {
                warn!(server = %name, "reconnect failed: {error}");
                self.sync_routes(&client).await;
                false
            }
        }
    }

    /// Route a call by qualified tool name.
    pub async fn call_tool(&self, qualified_name: &str, arguments: Value) -> ToolCallResult {
        let started = Instant::now();
        if !self.is_accepting() {
            return ToolCallResult::failure(ToolCallError::ShuttingDown, started.elapsed(), 0);
        }

        let target = {
            let registry = self.inner.registry.read().await;
            registry.routes.get(qualified_name).and_then(|route| {
                registry
                    .clients
                    .get(&route.server)
                    .map(|client| (Arc::clone(client), route.tool.name.clone()))
            })
        };
        let Some((client, tool_name)) = target else {
            return ToolCallResult::failure(
                ToolCallError::ToolNotFound {
                    name: qualified_name.to_string(),
                },
                started.elapsed(),
                0,
            );
        };

        let result = client.call_tool(&tool_name, arguments).await;
        self.inner.global.lock().await.record_call(result.success);
        if matches!(result.error, Some(ToolCallError::Transport(_))) {
            self.sync_routes(&client).await;
        }
        result
    }

    /// Read a resource.
    ///
    /// With `server` the request goes to that server. Otherwise the uri's owner is looked up
    /// in the routing table, and failing that every connected server offering resources is
    /// asked in registration order until one succeeds.
    pub async fn read_resource(&self, uri: &str, server: Option<&str>) -> ToolCallResult {
        let started = Instant::now();
        if !self.is_accepting() {
            return ToolCallResult::failure(ToolCallError::ShuttingDown, started.elapsed(), 0);
        }

        if let Some(server) = server {
            let Some(client) = self.server(server).await else {
                let error = ToolCallError::ServerNotFound { name: server.to_string() };
                return ToolCallResult::failure(error, started.elapsed(), 0);
            };
            return self.finish_request(&client, client.read_resource(uri).await).await;
        }

        let owner = {
            let registry = self.inner.registry.read().await;
            registry
                .resources
                .get(uri)
                .and_then(|route| registry.clients.get(&route.server).cloned())
        };
        if let Some(client) = owner {
            return self.finish_request(&client, client.read_resource(uri).await).await;
        }

        for client in self.clients().await {
            if !client.supports_resources().await {
                continue;
            }
            let result = client.read_resource(uri).await;
            if result.success {
                return self.finish_request(&client, result).await;
            }
            debug!(server = %client.name(), uri, "resource not readable here: {}", result.error_message().unwrap_or_default());
        }
        let error = ToolCallError::ResourceNotFound { uri: uri.to_string() };
        ToolCallResult::failure(error, started.elapsed(), 0)
    }

    /// Render a prompt.
    ///
    /// With `server`, `name` is that server's local prompt name. Otherwise it is looked up as
    /// a qualified name first and as a local name of any routed server second.
    pub async fn get_prompt(&self, name: &str, arguments: Value, server: Option<&str>) -> ToolCallResult {
        let started = Instant::now();
        if !self.is_accepting() {
            return ToolCallResult::failure(ToolCallError::ShuttingDown, started.elapsed(), 0);
        }

        let target = match server {
            Some(server) => match self.server(server).await {
                Some(client) => Some((client, name.to_string())),
                None => {
                    let error = ToolCallError::ServerNotFound { name: server.to_string() };
                    return ToolCallResult::failure(error, started.elapsed(), 0);
                }
            },
            None => {
                let registry = self.inner.registry.read().await;
                registry
                    .prompts
                    .get(name)
                    .or_else(|| registry.prompts.values().find(|route| route.prompt.name == name))
                    .and_then(|route| {
                        registry
                            .clients
                            .get(&route.server)
                            .map(|client| (Arc::clone(client), route.prompt.name.clone()))
                    })
            }
        };
        let Some((client, local)) = target else {
            let error = ToolCallError::PromptNotFound { name: name.to_string() };
            return ToolCallResult::failure(error, started.elapsed(), 0);
        };
        self.finish_request(&client, client.get_prompt(&local, arguments).await).await
    }

    /// Re-list a server's resources and refresh the routing table. False when the server is
    /// unknown, disconnected, offers no resources or the listing failed.
    pub async fn fetch_resources(&self, server: &str) -> bool {
        let Some(client) = self.server(server).await else {
            return false;
        };
        let fetched = client.fetch_resources().await;
        self.sync_routes(&client).await;
        match fetched {
            Ok(resources) => {
                debug!(server, count = resources.len(), "resources refreshed");
                true
            }
            Err(error) => {
                warn!(server, "resource refresh failed: {error}");
                false
            }
        }
    }

    /// Re-list a server's prompts and refresh the routing table. False when the server is
    /// unknown, disconnected, offers no prompts or the listing failed.
    pub async fn fetch_prompts(&self, server: &str) -> bool {
        let Some(client) = self.server(server).await else {
            return false;
        };
        let fetched = client.fetch_prompts().await;
        self.sync_routes(&client).await;
        match fetched {
            Ok(prompts) => {
                debug!(server, count = prompts.len(), "prompts refreshed");
                true
            }
            Err(error) => {
                warn!(server, "prompt refresh failed: {error}");
                false
            }
        }
    }

    /// Close a server's circuit breaker. False when the server is unknown.
    pub async fn reset_circuit_breaker(&self, server: &str) -> bool {
        match self.server(server).await {
            Some(client) => {
                client.reset_circuit_breaker().await;
                true
            }
            None => false,
        }
    }

    /// Every routable tool keyed by qualified name.
    pub async fn all_tools(&self) -> BTreeMap<String, RoutedTool> {
        self.inner.registry.read().await.routes.clone()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.inner.registry.read().await.routes.keys().cloned().collect()
    }

    /// Every routable resource keyed by uri.
    pub async fn all_resources(&self) -> BTreeMap<String, RoutedResource> {
        self.inner.registry.read().await.resources.clone()
    }

    /// Every routable prompt keyed by qualified name.
    pub async fn all_prompts(&self) -> BTreeMap<String, RoutedPrompt> {
        self.inner.registry.read().await.prompts.clone()
    }

    /// The client registered under `name`.
    pub async fn server(&self, name: &str) -> Option<Arc<ServerClient>> {
        self.inner.registry.read().await.clients.get(name).cloned()
    }

    /// Names of connected servers in registration order.
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names = Vec::new();
        for client in self.clients().await {
            if client.is_connected().await {
                names.push(client.name().to_string());
            }
        }
        names
    }

    /// Names of enabled servers that are not connected.
    pub async fn disconnected_servers(&self) -> Vec<String> {
        let mut names = Vec::new();
        for client in self.clients().await {
            if client.is_enabled() && !client.is_connected().await {
                names.push(client.name().to_string());
            }
        }
        names
    }

    /// Per-server status rows plus totals.
    pub async fn get_status(&self) -> ManagerStatus {
        let clients = self.clients().await;
        let mut servers = BTreeMap::new();
        for client in &clients {
            servers.insert(client.name().to_string(), client.status().await);
        }

        let connected_servers = servers.values().filter(|status| status.connected).count();
        let disconnected_servers = servers
            .values()
            .filter(|status| status.enabled && !status.connected)
            .count();
        let (total_tools, total_resources, total_prompts) = {
            let registry = self.inner.registry.read().await;
            (registry.routes.len(), registry.resources.len(), registry.prompts.len())
        };
        ManagerStatus {
            total_servers: clients.len(),
            connected_servers,
            disconnected_servers,
            total_tools,
            total_resources,
            total_prompts,
            heartbeat_running: self.is_heartbeat_running().await,
            servers,
        }
    }

    /// Global, per-server and per-tool counters. Tools are keyed by qualified name.
    pub async fn get_all_stats(&self) -> StatsSnapshot {
        let prefix = self.options().await.tool_prefix;
        let mut servers = BTreeMap::new();
        let mut tools = BTreeMap::new();

        for client in self.clients().await {
            servers.insert(client.name().to_string(), client.stats().await);
            for (local, stats) in client.tool_stats().await {
                let key = qualified_name(&prefix, client.name(), &local);
                let mut snapshot = stats.snapshot();
                snapshot.tool_key = key.clone();
                tools.insert(key, snapshot);
            }
        }

        StatsSnapshot {
            global: self.inner.global.lock().await.snapshot(),
            servers,
            tools,
        }
    }

    /// Counters of one tool by qualified name, if it has been called.
    pub async fn get_tool_stats(&self, qualified: &str) -> Option<ToolStatsSnapshot> {
        let prefix = self.options().await.tool_prefix;
        for client in self.clients().await {
            for (local, stats) in client.tool_stats().await {
                if qualified_name(&prefix, client.name(), &local) == qualified {
                    let mut snapshot = stats.snapshot();
                    snapshot.tool_key = qualified.to_string();
                    return Some(snapshot);
                }
            }
        }
        None
    }

    /// Start the periodic heartbeat. Returns false when it is disabled, already running or
    /// the manager is shut down.
    pub async fn start_heartbeat(&self) -> bool {
        if !self.is_accepting() || !self.options().await.heartbeat_enabled {
            return false;
        }
        let mut heartbeat = self.inner.heartbeat.lock().await;
        if heartbeat.as_ref().is_some_and(Heartbeat::is_running) {
            return false;
        }
        *heartbeat = Some(Heartbeat::spawn(Arc::downgrade(&self.inner)));
        true
    }

    /// Stop the heartbeat and wait for it to exit.
    pub async fn stop_heartbeat(&self) {
        let heartbeat = self.inner.heartbeat.lock().await.take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
    }

    pub async fn is_heartbeat_running(&self) -> bool {
        self.inner.heartbeat.lock().await.as_ref().is_some_and(Heartbeat::is_running)
    }

    /// Run one heartbeat pass over every enabled server, concurrently.
    ///
    /// Connected servers are pinged within `heartbeat_timeout`; disconnected ones get one
    /// connect attempt when `auto_reconnect` is on, bounded by the shorter of
    /// `heartbeat_timeout` and the connect timeout.
    pub async fn heartbeat_tick(&self) {
        if !self.is_accepting() {
            return;
        }
        let options = self.options().await;
        let clients: Vec<_> = self.clients().await.into_iter().filter(|client| client.is_enabled()).collect();
        join_all(clients.iter().map(|client| self.check_server(client, &options))).await;
    }

    /// Names of the servers the heartbeat looks after.
    pub(crate) async fn heartbeat_targets(&self) -> Vec<String> {
        if !self.is_accepting() {
            return Vec::new();
        }
        let registry = self.inner.registry.read().await;
        registry
            .clients
            .values()
            .filter(|client| client.is_enabled())
            .map(|client| client.name().to_string())
            .collect()
    }

    /// One heartbeat check of the named server.
    pub(crate) async fn heartbeat_server(&self, name: &str) -> HeartbeatOutcome {
        match self.server(name).await {
            Some(client) if self.is_accepting() => {
                let options = self.options().await;
                self.check_server(&client, &options).await
            }
            _ => HeartbeatOutcome::Idle,
        }
    }

    /// Stop accepting work, stop the heartbeat and disconnect every server. Idempotent.
    pub async fn shutdown(&self) {
        let was_accepting = self.inner.accepting.swap(false, Ordering::SeqCst);
        self.stop_heartbeat().await;

        let clients: Vec<_> = {
            let mut registry = self.inner.registry.write().await;
            registry.routes.clear();
            registry.resources.clear();
            registry.prompts.clear();
            registry.routed.clear();
            registry.clients.drain(..).map(|(_, client)| client).collect()
        };
        join_all(clients.iter().map(|client| client.disconnect())).await;

        if was_accepting || !clients.is_empty() {
            info!(servers = clients.len(), "client manager shut down");
        }
    }

    async fn check_server(&self, client: &Arc<ServerClient>, options: &ManagerOptions) -> HeartbeatOutcome {
        match client.state().await {
            ConnectionState::Connected | ConnectionState::Failing => {
                let health = client.check_health().await;
                let outcome = if health.healthy {
                    HeartbeatOutcome::Healthy
                } else {
                    let error = health.error.unwrap_or_default();
                    debug!(server = %client.name(), "heartbeat failed: {error}");
                    self.emit(ManagerEvent::HeartbeatFailed {
                        server: client.name().to_string(),
                        error,
                    });
                    HeartbeatOutcome::Unhealthy
                };
                self.sync_routes(client).await;
                outcome
            }
            ConnectionState::Disconnected if options.auto_reconnect => {
                let timeout = options.heartbeat_reconnect_timeout();
                if client.connect_with_timeout(timeout).await.is_err() {
                    return HeartbeatOutcome::Unreachable;
                }
                client.record_reconnect().await;
                if !self.is_registered(client).await {
                    client.disconnect().await;
                    return HeartbeatOutcome::Idle;
                }
                self.sync_routes(client).await;
                info!(server = %client.name(), "reconnected by heartbeat");
                self.emit(ManagerEvent::Reconnected {
                    server: client.name().to_string(),
                });
                HeartbeatOutcome::Reconnected
            }
            ConnectionState::Disconnected => HeartbeatOutcome::Unreachable,
            ConnectionState::Connecting => HeartbeatOutcome::Idle,
        }
    }

    /// Count a finished resource or prompt request; withdraw routes after a transport failure.
    async fn finish_request(&self, client: &Arc<ServerClient>, result: ToolCallResult) -> ToolCallResult {
        self.inner.global.lock().await.record_call(result.success);
        if matches!(result.error, Some(ToolCallError::Transport(_))) {
            self.sync_routes(client).await;
        }
        result
    }

    /// Make the routing tables reflect the client's current catalog.
    ///
    /// The client is read while the registry write lock is held, so concurrent syncs of one
    /// client apply in order and the last one always sees the latest connection state.
    async fn sync_routes(&self, client: &Arc<ServerClient>) {
        let prefix = self.options().await.tool_prefix;
        let name = client.name();

        let change = {
            let mut registry = self.inner.registry.write().await;
            if !registry.owns(client) {
                return;
            }
            let catalog = client.catalog().await;
            let connected = catalog.connected;
            registry.withdraw(name);

            let count = if connected { catalog.tools.len() } else { 0 };
            if connected {
                for tool in catalog.tools {
                    let key = qualified_name(&prefix, name, &tool.name);
                    let route = RoutedTool {
                        server: name.to_string(),
                        tool,
                    };
                    if let Some(previous) = registry.routes.insert(key.clone(), route) {
                        warn!(tool = %key, "qualified name shadows a tool of server '{}'", previous.server);
                    }
                }
                for resource in catalog.resources {
                    let uri = resource.uri.clone();
                    let route = RoutedResource {
                        server: name.to_string(),
                        resource,
                    };
                    if let Some(previous) = registry.resources.insert(uri.clone(), route) {
                        warn!(uri = %uri, "resource uri shadows one of server '{}'", previous.server);
                    }
                }
                for prompt in catalog.prompts {
                    let key = qualified_name(&prefix, name, &prompt.name);
                    let route = RoutedPrompt {
                        server: name.to_string(),
                        prompt,
                    };
                    if let Some(previous) = registry.prompts.insert(key.clone(), route) {
                        warn!(prompt = %key, "qualified name shadows a prompt of server '{}'", previous.server);
                    }
                }
            }

            let was_routed = registry.routed.contains(name);
            match (was_routed, connected) {
                (false, true) => {
                    registry.routed.insert(name.to_string());
                    Some(ManagerEvent::Connected {
                        server: name.to_string(),
                        tools: count,
                    })
                }
                (true, false) => {
                    registry.routed.remove(name);
                    Some(ManagerEvent::Disconnected { server: name.to_string() })
                }
                _ => None,
            }
        };

        if let Some(event) = change {
            self.emit(event);
        }
    }

    async fn clients(&self) -> Vec<Arc<ServerClient>> {
        self.inner.registry.read().await.clients.values().cloned().collect()
    }

    async fn is_registered(&self, client: &Arc<ServerClient>) -> bool {
        self.inner.registry.read().await.owns(client)
    }

    fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}
