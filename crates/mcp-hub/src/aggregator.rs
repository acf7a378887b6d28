//! Many servers behind one `McpCapabilities`.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::connection::{ConnectionOptions, McpConnection};
use crate::error::{McpError, Result};
use crate::protocol::models::CapabilityKind;
use crate::provider::McpCapabilities;
use crate::registry::{CapabilityRegistry, Exposable, RegistryBuilder, RegistryEntry};
use crate::types::{
    McpCallResult, McpPrompt, McpPromptResult, McpResource, McpResourceContents, McpTool,
};

type Slot<T> = RwLock<Option<Arc<CapabilityRegistry<T>>>>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorStats {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub total_tools: usize,
    pub conflicts: usize,
    pub uptime_secs: u64,
}

/// Per-kind glue between the aggregator and its registries.
trait Aggregated: Exposable {
    const KIND: CapabilityKind;

    fn slot(aggregator: &McpAggregator) -> &Slot<Self>;

    fn list(connection: McpConnection) -> BoxFuture<'static, Result<Vec<Self>>>;
}

impl Aggregated for McpTool {
    const KIND: CapabilityKind = CapabilityKind::Tools;

    fn slot(aggregator: &McpAggregator) -> &Slot<Self> {
        &aggregator.tools
    }

    fn list(connection: McpConnection) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { connection.list_tools().await }.boxed()
    }
}

impl Aggregated for McpPrompt {
    const KIND: CapabilityKind = CapabilityKind::Prompts;

    fn slot(aggregator: &McpAggregator) -> &Slot<Self> {
        &aggregator.prompts
    }

    fn list(connection: McpConnection) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { connection.list_prompts().await }.boxed()
    }
}

impl Aggregated for McpResource {
    const KIND: CapabilityKind = CapabilityKind::Resources;

    fn slot(aggregator: &McpAggregator) -> &Slot<Self> {
        &aggregator.resources
    }

    fn list(connection: McpConnection) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { connection.list_resources().await }.boxed()
    }
}

/// Presents the capabilities of several servers as one flat namespace.
pub struct McpAggregator {
    connections: Vec<McpConnection>,
    config: AggregatorConfig,
    timeout: Duration,
    tools: Slot<McpTool>,
    prompts: Slot<McpPrompt>,
    resources: Slot<McpResource>,
    build_lock: Mutex<()>,
    started_at: Instant,
}

impl McpAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        Self::with_options(config, ConnectionOptions::default())
    }

    pub fn with_options(config: AggregatorConfig, options: ConnectionOptions) -> Result<Self> {
        config.validate()?;
        let connections: Vec<McpConnection> = config
            .servers
            .iter()
            .filter(|descriptor| descriptor.routing_enabled)
            .map(|descriptor| McpConnection::with_options(descriptor.clone(), options.clone()))
            .collect();
        info!(
            "MCP aggregator over {} server(s), conflicts resolved by {:?}",
            connections.len(),
            config.conflict_resolution
        );
        Ok(Self {
            connections,
            timeout: Duration::from_millis(config.timeout_ms),
            config,
            tools: RwLock::new(None),
            prompts: RwLock::new(None),
            resources: RwLock::new(None),
            build_lock: Mutex::new(()),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Owned connections in configuration order.
    pub fn connections(&self) -> &[McpConnection] {
        &self.connections
    }

    /// Connect every eager server. Failures are logged, not fatal; returns how
    /// many servers are connected afterwards.
    pub async fn connect_all(&self) -> usize {
        let eager = self
            .connections
            .iter()
            .filter(|connection| !connection.descriptor().is_lazy());
        let outcomes = join_all(eager.map(|connection| async move {
            (connection.name(), connection.connect().await)
        }))
        .await;
        for (name, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!("Aggregated MCP server '{}' failed to connect: {}", name, e);
            }
        }
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    /// Drop every registry and every connection's cached listings; the next
    /// access re-lists all servers.
    pub fn clear(&self) {
        *self.tools.write() = None;
        *self.prompts.write() = None;
        *self.resources.write() = None;
        for connection in &self.connections {
            connection.invalidate_cache();
        }
        debug!("MCP aggregator registries cleared");
    }

    pub fn stats(&self) -> AggregatorStats {
        let conflicts = self.tools.read().as_ref().map_or(0, |r| r.conflicts())
            + self.prompts.read().as_ref().map_or(0, |r| r.conflicts())
            + self.resources.read().as_ref().map_or(0, |r| r.conflicts());
        AggregatorStats {
            total_servers: self.connections.len(),
            connected_servers: self.connections.iter().filter(|c| c.is_connected()).count(),
            total_tools: self.tools.read().as_ref().map_or(0, |r| r.len()),
            conflicts,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down MCP aggregator");
        for connection in &self.connections {
            if let Err(e) = connection.disconnect().await {
                warn!("Error disconnecting '{}': {}", connection.name(), e);
            }
        }
        self.clear();
    }

    /// Look up a tool registry entry by its exposed name.
    pub async fn tool_entry(&self, exposed: &str) -> Result<RegistryEntry<McpTool>> {
        self.bounded(&format!("Looking up tool '{}'", exposed), async {
            self.entry::<McpTool>(exposed).await.map(|(_, entry)| entry)
        })
        .await
    }

    /// The registry for `T`, built on first access.
    async fn registry<T: Aggregated>(&self) -> Result<Built<T>> {
        if let Some(registry) = T::slot(self).read().clone() {
            return Ok(Built::complete(registry));
        }

        let _building = self.build_lock.lock().await;
        if let Some(registry) = T::slot(self).read().clone() {
            return Ok(Built::complete(registry));
        }

        // Listings run as their own tasks so a server that misses the
        // deadline keeps connecting and is picked up by a later build.
        let listings = join_all(self.connections.iter().map(|connection| {
            let listing = tokio::spawn(T::list(connection.clone()));
            async move {
                match tokio::time::timeout(self.timeout, listing).await {
                    Ok(Ok(outcome)) => Some(outcome),
                    Ok(Err(e)) => Some(Err(McpError::Protocol(format!(
                        "listing task failed: {}",
                        e
                    )))),
                    Err(_) => None,
                }
            }
        }))
        .await;

        let mut builder = RegistryBuilder::new(self.config.conflict_resolution);
        let mut missing = Vec::new();
        for (connection, listing) in self.connections.iter().zip(listings) {
            let items = match listing {
                Some(Ok(items)) => items,
                Some(Err(e)) => {
                    warn!(
                        "Listing {} on '{}' failed, leaving them out: {}",
                        T::KIND,
                        connection.name(),
                        e
                    );
                    continue;
                }
                None => {
                    warn!(
                        "Listing {} on '{}' took longer than {}ms, leaving them out",
                        T::KIND,
                        connection.name(),
                        self.timeout.as_millis()
                    );
                    missing.push(connection.name().to_string());
                    continue;
                }
            };
            for item in items {
                builder.register(connection.name(), item)?;
            }
        }

        let registry = Arc::new(builder.build());
        info!(
            "MCP aggregator registered {} {} ({} conflict(s))",
            registry.len(),
            T::KIND,
            registry.conflicts()
        );
        if missing.is_empty() {
            *T::slot(self).write() = Some(registry.clone());
        }
        Ok(Built { registry, missing })
    }

    async fn entry<T: Aggregated>(
        &self,
        exposed: &str,
    ) -> Result<(McpConnection, RegistryEntry<T>)> {
        let Built { registry, missing } = self.registry::<T>().await?;
        let entry = registry.get(exposed).cloned().ok_or_else(|| {
            if !missing.is_empty() {
                return McpError::Timeout(format!(
                    "'{}' is unknown and {} did not list {} within {}ms",
                    exposed,
                    missing.join(", "),
                    T::KIND,
                    self.timeout.as_millis()
                ));
            }
            match T::KIND {
                CapabilityKind::Tools => McpError::ToolNotFound(exposed.to_string()),
                kind => McpError::CapabilityUnsupported {
                    server: "aggregator".to_string(),
                    capability: format!("{} '{}'", kind, exposed),
                },
            }
        })?;
        let connection = self
            .connections
            .iter()
            .find(|c| c.name() == entry.server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(entry.server.clone()))?;
        Ok((connection, entry))
    }

    async fn bounded<R>(&self, label: &str, call: impl std::future::Future<Output = Result<R>>) -> Result<R> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(format!(
                "{} timed out after {}ms",
                label,
                self.timeout.as_millis()
            ))),
        }
    }
}

/// A registry plus the servers that missed the listing deadline. Only
/// complete registries are cached.
struct Built<T> {
    registry: Arc<CapabilityRegistry<T>>,
    missing: Vec<String>,
}

impl<T> Built<T> {
    fn complete(registry: Arc<CapabilityRegistry<T>>) -> Self {
        Self {
            registry,
            missing: Vec::new(),
        }
    }
}

// Each entry point runs lookup and call under one aggregator deadline.
#[async_trait]
impl McpCapabilities for McpAggregator {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self.registry::<McpTool>().await?.registry.capabilities())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult> {
        self.bounded(&format!("Tool '{}'", name), async {
            let (connection, entry) = self.entry::<McpTool>(name).await?;
            debug!(
                "Aggregated tool '{}' -> '{}' on '{}'",
                name, entry.original_name, entry.server
            );
            connection.call_tool(&entry.original_name, arguments).await
        })
        .await
    }

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        Ok(self.registry::<McpPrompt>().await?.registry.capabilities())
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<McpPromptResult> {
        self.bounded(&format!("Prompt '{}'", name), async {
            let (connection, entry) = self.entry::<McpPrompt>(name).await?;
            connection.get_prompt(&entry.original_name, arguments).await
        })
        .await
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        Ok(self.registry::<McpResource>().await?.registry.capabilities())
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContents>> {
        self.bounded(&format!("Resource '{}'", uri), async {
            let (connection, entry) = self.entry::<McpResource>(uri).await?;
            connection.read_resource(&entry.original_name).await
        })
        .await
    }
}
