use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionMode, McpConfig, ServerDescriptor};
use crate::connection::{ConnectionOptions, McpConnection};
use crate::error::{McpError, Result};
use crate::protocol::models::CapabilityKind;
use crate::tool_index::{CapabilityIndex, ServerListing};
use crate::types::{
    BringUpReport, ConnectionStatus, FailureRecord, McpCallResult, McpEvent, McpPrompt,
    McpPromptResult, McpResource, McpResourceContents, McpTool,
};

/// Manages MCP server connections and routes qualified capability names
pub struct McpServerManager {
    connections: Arc<DashMap<String, McpConnection>>,
    index: Arc<RwLock<Arc<CapabilityIndex>>>,
    failures: DashMap<String, FailureRecord>,
    options: ConnectionOptions,
    event_tx: Option<mpsc::Sender<McpEvent>>,
    shutdown: AtomicBool,
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::with_options(ConnectionOptions::default())
    }

    pub fn with_options(options: ConnectionOptions) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            index: Arc::new(RwLock::new(Arc::new(CapabilityIndex::new()))),
            failures: DashMap::new(),
            options,
            event_tx: None,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<McpEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// The current index snapshot.
    pub fn index(&self) -> Arc<CapabilityIndex> {
        self.index.read().clone()
    }

    /// Bring up every routing-enabled server in `config`.
    ///
    /// Eager servers connect concurrently; lazy ones are registered and
    /// connect on first use. A strict server that fails tears down everything
    /// this call started.
    pub async fn initialize_from_config(&self, config: &McpConfig) -> Result<BringUpReport> {
        config.validate()?;

        let mut report = BringUpReport::default();
        let mut started = Vec::new();
        let mut eager = Vec::new();

        for descriptor in &config.servers {
            let name = descriptor.name.clone();
            if !descriptor.routing_enabled {
                info!("MCP server '{}' has routing disabled, skipping", name);
                report.skipped.push(name);
                continue;
            }
            if self.connections.contains_key(&name) {
                warn!("MCP server '{}' is already registered, skipping", name);
                continue;
            }

            let connection = McpConnection::with_options(descriptor.clone(), self.options.clone());
            self.connections.insert(name.clone(), connection.clone());
            self.follow_changes(&connection);
            started.push(name.clone());

            if descriptor.is_lazy() {
                debug!("MCP server '{}' deferred until first use", name);
                report.deferred.push(name);
            } else {
                eager.push(connection);
            }
        }

        info!(
            "Bringing up {} MCP server(s), {} deferred",
            eager.len(),
            report.deferred.len()
        );

        let outcomes = join_all(eager.into_iter().map(|connection| async move {
            let outcome = connection.connect().await;
            (connection, outcome)
        }))
        .await;

        let mut aborted: Option<(String, McpError)> = None;
        for (connection, outcome) in outcomes {
            let name = connection.name().to_string();
            match outcome {
                Ok(()) => {
                    self.failures.remove(&name);
                    self.emit(McpEvent::ServerConnected {
                        server_id: name.clone(),
                    })
                    .await;
                    report.connected.push(name);
                }
                Err(e) => {
                    self.emit(McpEvent::ServerFailed {
                        server_id: name.clone(),
                        error: e.to_string(),
                    })
                    .await;
                    self.connections.remove(&name);
                    if connection.descriptor().connection_mode == ConnectionMode::Strict
                        && aborted.is_none()
                    {
                        aborted = Some((name, e));
                    } else {
                        warn!("MCP server '{}' failed to start: {}", name, e);
                        report.failed.push(self.record_failure(&name, &e));
                    }
                }
            }
        }

        if let Some((server, reason)) = aborted {
            error!(
                "Strict MCP server '{}' failed, aborting bring-up: {}",
                server, reason
            );
            for name in started {
                if let Some((_, connection)) = self.connections.remove(&name) {
                    if let Err(e) = connection.disconnect().await {
                        warn!("Error disconnecting MCP server '{}': {}", name, e);
                    }
                    self.emit(McpEvent::ServerDisconnected { server_id: name }).await;
                }
            }
            self.refresh_index().await;
            return Err(McpError::BringUpAborted {
                server,
                reason: Box::new(reason),
            });
        }

        self.refresh_index().await;
        info!(
            "MCP bring-up finished: {} connected, {} deferred, {} failed, {} skipped",
            report.connected.len(),
            report.deferred.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Start a single server. Lazy servers are only registered.
    pub async fn start_server(&self, descriptor: ServerDescriptor) -> Result<()> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        if self.connections.contains_key(&name) {
            return Err(McpError::AlreadyRunning(name));
        }

        info!("Starting MCP server '{}'", name);
        let connection = McpConnection::with_options(descriptor, self.options.clone());
        if connection.descriptor().is_lazy() {
            self.connections.insert(name, connection.clone());
            self.follow_changes(&connection);
            return Ok(());
        }

        if let Err(e) = connection.connect().await {
            error!("Failed to start MCP server '{}': {}", name, e);
            self.record_failure(&name, &e);
            self.emit(McpEvent::ServerFailed {
                server_id: name,
                error: e.to_string(),
            })
            .await;
            return Err(e);
        }

        self.failures.remove(&name);
        self.connections.insert(name.clone(), connection.clone());
        self.follow_changes(&connection);
        self.emit(McpEvent::ServerConnected {
            server_id: name.clone(),
        })
        .await;

        let listing = list_server(&connection).await;
        self.update(|index| Some(index.with_server(listing))).await;
        Ok(())
    }

    /// Stop an MCP server connection
    pub async fn stop_server(&self, server_id: &str) -> Result<()> {
        let (_, connection) = self
            .connections
            .remove(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        info!("Stopping MCP server '{}'", server_id);
        if let Err(e) = connection.disconnect().await {
            warn!("Error disconnecting MCP server '{}': {}", server_id, e);
        }

        self.update(|index| Some(index.without_server(server_id))).await;
        self.emit(McpEvent::ServerDisconnected {
            server_id: server_id.to_string(),
        })
        .await;
        info!("MCP server '{}' stopped", server_id);
        Ok(())
    }

    /// End the server-side session. The server stays registered and can be
    /// reconnected.
    pub async fn terminate_session(&self, server_id: &str) -> Result<()> {
        let connection = self.connection(server_id)?;
        let terminated = connection.terminate_session().await;

        self.update(|index| Some(index.without_server(server_id))).await;
        self.emit(McpEvent::ServerDisconnected {
            server_id: server_id.to_string(),
        })
        .await;
        terminated
    }

    /// Re-list every connected server and publish a fresh index.
    pub async fn refresh_index(&self) {
        let mut connected: Vec<McpConnection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|connection| connection.is_connected())
            .collect();
        connected.sort_by(|a, b| a.name().cmp(b.name()));

        let listings = join_all(connected.iter().map(list_server)).await;
        self.update(|_| Some(CapabilityIndex::from_listings(listings))).await;
    }

    /// Call a tool by its qualified name
    pub async fn call_tool(&self, qualified: &str, args: Value) -> Result<McpCallResult> {
        let (connection, tool_name) = self.route(CapabilityKind::Tools, qualified)?;
        let was_connected = connection.is_connected();

        let result = connection.call_tool(&tool_name, args).await;

        self.emit(McpEvent::ToolExecuted {
            server_id: connection.name().to_string(),
            tool_name,
            success: matches!(&result, Ok(r) if !r.is_error),
        })
        .await;
        self.after_call(&connection, was_connected, &result).await;
        result
    }

    pub fn list_tools(&self) -> Vec<McpTool> {
        self.index().tools()
    }

    pub fn list_prompts(&self) -> Vec<McpPrompt> {
        self.index().prompts()
    }

    pub fn list_resources(&self) -> Vec<McpResource> {
        self.index().resources()
    }

    pub async fn get_prompt(
        &self,
        qualified: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<McpPromptResult> {
        let (connection, name) = self.route(CapabilityKind::Prompts, qualified)?;
        let was_connected = connection.is_connected();
        let result = connection.get_prompt(&name, arguments).await;
        self.after_call(&connection, was_connected, &result).await;
        result
    }

    pub async fn read_resource(&self, qualified_uri: &str) -> Result<Vec<McpResourceContents>> {
        let (connection, uri) = self.route(CapabilityKind::Resources, qualified_uri)?;
        let was_connected = connection.is_connected();
        let result = connection.read_resource(&uri).await;
        self.after_call(&connection, was_connected, &result).await;
        result
    }

    /// Get all server IDs
    pub fn list_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        servers.sort();
        servers
    }

    pub fn server_status(&self, server_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .get(server_id)
            .map(|entry| entry.value().clone())
            .map(|connection| connection.connection_status())
    }

    /// Servers that failed to start, sorted by name.
    pub fn failures(&self) -> Vec<FailureRecord> {
        let mut failures: Vec<FailureRecord> =
            self.failures.iter().map(|entry| entry.value().clone()).collect();
        failures.sort_by(|a, b| a.server.cmp(&b.server));
        failures
    }

    /// Check if a server is running
    pub fn is_server_running(&self, server_id: &str) -> bool {
        self.connections
            .get(server_id)
            .map(|entry| entry.value().is_connected())
            .unwrap_or(false)
    }

    /// Probe every connected server; returns the ones found dead.
    pub async fn check_health(&self) -> Vec<String> {
        let connections: Vec<McpConnection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|connection| connection.is_connected())
            .collect();

        let mut failed = Vec::new();
        for connection in connections {
            if let Err(e) = connection.check_health().await {
                let name = connection.name().to_string();
                warn!("Health check failed for MCP server '{}': {}", name, e);
                self.record_failure(&name, &e);
                self.emit(McpEvent::ServerFailed {
                    server_id: name.clone(),
                    error: e.to_string(),
                })
                .await;
                failed.push(name);
            }
        }

        if !failed.is_empty() {
            self.update(|index| {
                Some(
                    failed
                        .iter()
                        .fold(index.clone(), |index, name| index.without_server(name)),
                )
            })
            .await;
        }
        failed
    }

    /// Periodically probe every connection until the manager shuts down or
    /// is dropped.
    pub fn start_health_monitor(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let failed = manager.check_health().await;
                if !failed.is_empty() {
                    debug!("Health monitor marked {:?} as failed", failed);
                }
            }
            debug!("MCP health monitor stopped");
        })
    }

    /// Shutdown all servers
    pub async fn shutdown_all(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for server_id in self.list_servers() {
            if let Err(e) = self.stop_server(&server_id).await {
                error!("Error stopping server '{}': {}", server_id, e);
            }
        }
    }

    fn connection(&self, server_id: &str) -> Result<McpConnection> {
        self.connections
            .get(server_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))
    }

    /// Resolve a qualified name. Servers with nothing indexed yet (lazy
    /// servers before first use) are routed by the name's prefix.
    fn route(&self, kind: CapabilityKind, qualified: &str) -> Result<(McpConnection, String)> {
        let index = self.index();
        if let Some(route) = index.lookup(kind, qualified) {
            let connection = self.connection(&route.server)?;
            return Ok((connection, route.local.clone()));
        }

        let not_found = || match kind {
            CapabilityKind::Tools => McpError::ToolNotFound(qualified.to_string()),
            _ => McpError::CapabilityUnsupported {
                server: qualified.to_string(),
                capability: kind.to_string(),
            },
        };
        let (server, local) = CapabilityIndex::split(qualified).ok_or_else(not_found)?;
        if index.indexes_server(server) {
            return Err(not_found());
        }
        let connection = self.connection(server)?;
        debug!("Routing '{}' to unindexed server '{}'", qualified, server);
        Ok((connection, local.to_string()))
    }

    /// Keep the index in step with connections that came up or went away
    /// during a call.
    async fn after_call<T>(&self, connection: &McpConnection, was_connected: bool, result: &Result<T>) {
        let name = connection.name().to_string();
        if !was_connected && connection.is_connected() {
            let listing = list_server(connection).await;
            self.update(|index| Some(index.with_server(listing))).await;
            self.emit(McpEvent::ServerConnected { server_id: name }).await;
            return;
        }
        if let Err(e @ (McpError::Disconnected | McpError::SessionExpired(_))) = result {
            self.record_failure(&name, e);
            self.update(|index| Some(index.without_server(&name))).await;
            self.emit(McpEvent::ServerFailed {
                server_id: name,
                error: e.to_string(),
            })
            .await;
        }
    }

    fn record_failure(&self, server: &str, error: &McpError) -> FailureRecord {
        let record = FailureRecord {
            server: server.to_string(),
            reason: error.to_string(),
            failed_at: Utc::now(),
        };
        self.failures.insert(server.to_string(), record.clone());
        record
    }

    async fn update(&self, change: impl FnOnce(&CapabilityIndex) -> Option<CapabilityIndex>) {
        update_index(&self.index, self.event_tx.as_ref(), change).await;
    }

    /// Re-index a server whenever it reports a changed listing. The task
    /// ends once the connection is gone.
    fn follow_changes(&self, connection: &McpConnection) {
        let mut changes = connection.subscribe_changes();
        let weak = connection.downgrade();
        let connections = self.connections.clone();
        let index = self.index.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if !connection.is_connected() {
                    continue;
                }
                let name = connection.name().to_string();
                debug!("Re-indexing MCP server '{}' after a list change", name);
                let listing = list_server(&connection).await;
                update_index(&index, event_tx.as_ref(), |current| {
                    // Stopped or replaced while listing.
                    let registered = connections
                        .get(&name)
                        .map_or(false, |entry| entry.value().same_as(&connection));
                    registered.then(|| current.with_server(listing))
                })
                .await;
            }
        });
    }

    async fn emit(&self, event: McpEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Swap in the index `change` derives from the current one. The new index
/// is computed under the write lock so concurrent updates compose.
async fn update_index(
    index: &RwLock<Arc<CapabilityIndex>>,
    event_tx: Option<&mpsc::Sender<McpEvent>>,
    change: impl FnOnce(&CapabilityIndex) -> Option<CapabilityIndex>,
) {
    let tools = {
        let mut current = index.write();
        let Some(next) = change(&**current) else {
            return;
        };
        let tools = next.tool_names();
        *current = Arc::new(next);
        tools
    };
    debug!("Published MCP index with {} tool(s)", tools.len());
    if let Some(tx) = event_tx {
        let _ = tx.send(McpEvent::ToolsChanged { tools }).await;
    }
}

/// List all three kinds; a kind that fails contributes nothing.
async fn list_server(connection: &McpConnection) -> ServerListing {
    let (tools, prompts, resources) = tokio::join!(
        connection.list_tools(),
        connection.list_prompts(),
        connection.list_resources()
    );
    let name = connection.name();
    ServerListing {
        server: name.to_string(),
        tools: tools.unwrap_or_else(|e| {
            warn!("Listing tools on '{}' failed: {}", name, e);
            Vec::new()
        }),
        prompts: prompts.unwrap_or_else(|e| {
            warn!("Listing prompts on '{}' failed: {}", name, e);
            Vec::new()
        }),
        resources: resources.unwrap_or_else(|e| {
            warn!("Listing resources on '{}' failed: {}", name, e);
            Vec::new()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::{prompt, remote, resource, FakeServer, FakeTransportFactory, Listing};
    use crate::transports::process::MockProcessHandle;
    use crate::types::ProcessStatus;
    use serde_json::json;

    fn manager(servers: Vec<FakeServer>) -> (McpServerManager, Arc<FakeTransportFactory>) {
        let factory = Arc::new(FakeTransportFactory::new(servers));
        let options = ConnectionOptions {
            factory: factory.clone(),
            listing_policy: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            connect_base_delay: Duration::from_millis(1),
            connect_max_delay: Duration::from_millis(1),
        };
        (McpServerManager::with_options(options), factory)
    }

    fn config(descriptors: Vec<ServerDescriptor>) -> McpConfig {
        McpConfig {
            servers: descriptors,
        }
    }

    fn refused() -> McpError {
        McpError::Connection("connection refused".into())
    }

    #[tokio::test]
    async fn test_bring_up_indexes_qualified_names() {
        let (manager, _) = manager(vec![
            FakeServer::new("fs").with_tools(&["read_file", "query"]),
            FakeServer::new("db").with_tools(&["query"]),
        ]);
        let report = manager
            .initialize_from_config(&config(vec![remote("fs"), remote("db")]))
            .await
            .unwrap();

        assert_eq!(report.connected.len(), 2);
        let names: Vec<String> = manager.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["db__query", "fs__query", "fs__read_file"]);
    }

    #[tokio::test]
    async fn test_call_routes_local_name_to_owner() {
        let (manager, factory) = manager(vec![
            FakeServer::new("fs").with_tools(&["query"]),
            FakeServer::new("db").with_tools(&["query"]),
        ]);
        manager
            .initialize_from_config(&config(vec![remote("fs"), remote("db")]))
            .await
            .unwrap();

        let result = manager.call_tool("db__query", json!({"sql": "select 1"})).await.unwrap();
        assert_eq!(result.text(), "db:query");
        assert_eq!(factory.server("db").call_log()[0].0, "query");
        assert!(factory.server("fs").call_log().is_empty());

        assert!(matches!(
            manager.call_tool("db__drop", json!({})).await,
            Err(McpError::ToolNotFound(_))
        ));
        assert!(matches!(
            manager.call_tool("nowhere__x", json!({})).await,
            Err(McpError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lenient_failure_is_recorded() {
        let (manager, _) = manager(vec![
            FakeServer::new("good").with_tools(&["a"]),
            FakeServer::new("bad").failing_connects(1, refused()),
        ]);
        let report = manager
            .initialize_from_config(&config(vec![remote("good"), remote("bad")]))
            .await
            .unwrap();

        assert_eq!(report.connected, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].server, "bad");
        assert_eq!(manager.failures()[0].server, "bad");
        assert_eq!(manager.list_servers(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_strict_failure_aborts_bring_up() {
        let (manager, _) = manager(vec![
            FakeServer::new("good").with_tools(&["a"]),
            FakeServer::new("critical").failing_connects(1, refused()),
        ]);
        let result = manager
            .initialize_from_config(&config(vec![
                remote("good"),
                remote("critical").with_mode(ConnectionMode::Strict),
            ]))
            .await;

        match result {
            Err(McpError::BringUpAborted { server, .. }) => assert_eq!(server, "critical"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.list_servers().is_empty());
        assert!(manager.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_routing_disabled_and_lazy_servers() {
        let (manager, factory) = manager(vec![
            FakeServer::new("hidden").with_tools(&["secret"]),
            FakeServer::new("remote").with_tools(&["search"]),
        ]);
        let mut hidden = remote("hidden");
        hidden.routing_enabled = false;
        let lazy = ServerDescriptor::streamable("remote", "http://remote.invalid/mcp");

        let report = manager
            .initialize_from_config(&config(vec![hidden, lazy]))
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["hidden"]);
        assert_eq!(report.deferred, vec!["remote"]);
        assert_eq!(factory.server("remote").created(), 0);
        assert!(manager.list_tools().is_empty());

        // First use routes by prefix, connects, then indexes the server.
        let result = manager.call_tool("remote__search", json!({})).await.unwrap();
        assert_eq!(result.text(), "remote:search");
        assert_eq!(factory.server("remote").created(), 1);
        assert!(manager.index().contains(CapabilityKind::Tools, "remote__search"));
        assert_eq!(factory.server("hidden").created(), 0);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (tx, mut rx) = mpsc::channel(32);
        let (manager, _) = manager(vec![FakeServer::new("fs").with_tools(&["read"])]);
        let manager = manager.with_event_channel(tx);

        manager
            .initialize_from_config(&config(vec![remote("fs")]))
            .await
            .unwrap();
        manager.call_tool("fs__read", json!({})).await.unwrap();
        manager.stop_server("fs").await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(&events[0], McpEvent::ServerConnected { server_id } if server_id == "fs"));
        assert!(events.iter().any(|e| matches!(e,
            McpEvent::ToolsChanged { tools } if tools == &vec!["fs__read".to_string()])));
        assert!(events.iter().any(|e| matches!(e,
            McpEvent::ToolExecuted { tool_name, success: true, .. } if tool_name == "read")));
        assert!(matches!(events.last(), Some(McpEvent::ServerDisconnected { .. })));
    }

    #[tokio::test]
    async fn test_start_and_stop_server() {
        let (manager, _) = manager(vec![FakeServer::new("fs").with_tools(&["read"])]);
        manager.start_server(remote("fs")).await.unwrap();
        assert!(manager.is_server_running("fs"));
        assert!(manager.index().contains(CapabilityKind::Tools, "fs__read"));

        assert!(matches!(
            manager.start_server(remote("fs")).await,
            Err(McpError::AlreadyRunning(_))
        ));

        manager.stop_server("fs").await.unwrap();
        assert!(!manager.is_server_running("fs"));
        assert!(manager.list_tools().is_empty());
        assert!(matches!(
            manager.stop_server("fs").await,
            Err(McpError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prompts_and_resources_are_routed() {
        let (manager, _) = manager(vec![FakeServer::new("docs")
            .with_prompts(Listing::Items(vec![prompt("summarize")]))
            .with_resources(Listing::Items(vec![resource("file:///readme", "readme")]))]);
        manager
            .initialize_from_config(&config(vec![remote("docs")]))
            .await
            .unwrap();

        assert_eq!(manager.list_prompts()[0].name, "docs__summarize");
        let prompt = manager.get_prompt("docs__summarize", None).await.unwrap();
        assert_eq!(prompt.description.as_deref(), Some("summarize prompt"));

        assert_eq!(manager.list_resources()[0].uri, "docs__file:///readme");
        let contents = manager.read_resource("docs__file:///readme").await.unwrap();
        assert_eq!(contents[0].uri, "file:///readme");
    }

    #[tokio::test]
    async fn test_health_check_drops_dead_server_from_index() {
        let mut process = MockProcessHandle::new();
        process.expect_pid().return_const(Some(11u32));
        process.expect_is_alive().return_const(false);
        process
            .expect_status()
            .return_const(ProcessStatus::Exited { code: Some(137) });

        let (manager, _) = manager(vec![
            FakeServer::new("crashy")
                .with_tools(&["a"])
                .with_process(Arc::new(process)),
            FakeServer::new("steady").with_tools(&["b"]),
        ]);
        manager
            .initialize_from_config(&config(vec![remote("crashy"), remote("steady")]))
            .await
            .unwrap();

        let failed = manager.check_health().await;
        assert_eq!(failed, vec!["crashy"]);
        assert_eq!(manager.list_tools().len(), 1);
        assert!(manager.failures()[0].reason.contains("137"));
        assert!(!manager.server_status("crashy").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_health_monitor_stops_on_shutdown() {
        let (manager, _) = manager(vec![FakeServer::new("fs").with_tools(&["read"])]);
        let manager = Arc::new(manager);
        manager
            .initialize_from_config(&config(vec![remote("fs")]))
            .await
            .unwrap();

        let monitor = manager.start_health_monitor(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.shutdown_all().await;
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.list_servers().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_session_keeps_server_registered() {
        let (manager, factory) = manager(vec![FakeServer::new("remote").with_tools(&["search"])]);
        manager.start_server(remote("remote")).await.unwrap();
        manager.terminate_session("remote").await.unwrap();

        assert_eq!(factory.server("remote").terminations.load(Ordering::SeqCst), 1);
        assert_eq!(manager.list_servers(), vec!["remote"]);
        assert!(manager.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_list_change_reindexes_server() {
        let (manager, factory) = manager(vec![FakeServer::new("fs").with_tools(&["read"])]);
        manager
            .initialize_from_config(&config(vec![remote("fs")]))
            .await
            .unwrap();
        assert!(!manager.index().contains(CapabilityKind::Tools, "fs__write"));

        factory.server("fs").announce_tool("write").await;
        let mut reindexed = false;
        for _ in 0..50 {
            if manager.index().contains(CapabilityKind::Tools, "fs__write") {
                reindexed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reindexed);
        assert!(manager.index().contains(CapabilityKind::Tools, "fs__read"));

        let result = manager.call_tool("fs__write", json!({})).await.unwrap();
        assert_eq!(result.text(), "fs:write");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_calls_to_lazy_servers_keep_both() {
        for _ in 0..20 {
            let (manager, _) = manager(vec![
                FakeServer::new("alpha").with_tools(&["a"]),
                FakeServer::new("beta").with_tools(&["b"]),
            ]);
            let manager = Arc::new(manager);
            manager
                .initialize_from_config(&config(vec![
                    ServerDescriptor::streamable("alpha", "http://alpha.invalid/mcp"),
                    ServerDescriptor::streamable("beta", "http://beta.invalid/mcp"),
                ]))
                .await
                .unwrap();

            let first = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.call_tool("alpha__a", json!({})).await })
            };
            let second = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.call_tool("beta__b", json!({})).await })
            };
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            let index = manager.index();
            assert!(index.contains(CapabilityKind::Tools, "alpha__a"));
            assert!(index.contains(CapabilityKind::Tools, "beta__b"));
        }
    }
}
