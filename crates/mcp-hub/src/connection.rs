//! One managed connection to one upstream MCP server.
//!
//! The connection owns the transport lifecycle, the handshake, the
//! capability cache and the liveness check of a subprocess. It is cheap to
//! clone; clones share the same session.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{ServerDescriptor, TransportKind};
use crate::error::{McpError, Result};
use crate::protocol::models::{CapabilityKind, Implementation, ServerCapabilities};
use crate::protocol::McpProtocolClient;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::timeouts::{effective_timeout, TimeoutCategory};
use crate::transports::{DefaultTransportFactory, ProcessHandle, TransportFactory};
use crate::types::{
    ConnectionState, ConnectionStatus, McpCallResult, McpPrompt, McpPromptResult, McpResource,
    McpResourceContents, McpTool, ProcessStatus,
};

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

/// Knobs that tests and embedders may want to turn.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub factory: Arc<dyn TransportFactory>,
    pub listing_policy: RetryPolicy,
    pub connect_base_delay: Duration,
    pub connect_max_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            factory: Arc::new(DefaultTransportFactory),
            listing_policy: RetryPolicy::listing(),
            connect_base_delay: Duration::from_secs(1),
            connect_max_delay: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }
}

struct Session {
    client: McpProtocolClient,
    capabilities: ServerCapabilities,
    server_info: Implementation,
    process: Option<Arc<dyn ProcessHandle>>,
    generation: u64,
}

#[derive(Default)]
struct CapabilityCache {
    generation: u64,
    tools: Option<Vec<McpTool>>,
    prompts: Option<Vec<McpPrompt>>,
    resources: Option<Vec<McpResource>>,
}

impl CapabilityCache {
    fn forget(&mut self, kind: CapabilityKind) {
        match kind {
            CapabilityKind::Tools => self.tools = None,
            CapabilityKind::Prompts => self.prompts = None,
            CapabilityKind::Resources => self.resources = None,
        }
    }
}

/// A listable capability that lives in the per-session cache.
trait CachedListing: Clone + Send + Sync + 'static {
    const KIND: CapabilityKind;

    fn slot(cache: &CapabilityCache) -> &Option<Vec<Self>>;

    fn slot_mut(cache: &mut CapabilityCache) -> &mut Option<Vec<Self>>;

    fn fetch(session: Arc<Session>, timeout: Duration) -> BoxFuture<'static, Result<Vec<Self>>>;
}

impl CachedListing for McpTool {
    const KIND: CapabilityKind = CapabilityKind::Tools;

    fn slot(cache: &CapabilityCache) -> &Option<Vec<Self>> {
        &cache.tools
    }

    fn slot_mut(cache: &mut CapabilityCache) -> &mut Option<Vec<Self>> {
        &mut cache.tools
    }

    fn fetch(session: Arc<Session>, timeout: Duration) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { session.client.list_tools(timeout).await }.boxed()
    }
}

impl CachedListing for McpPrompt {
    const KIND: CapabilityKind = CapabilityKind::Prompts;

    fn slot(cache: &CapabilityCache) -> &Option<Vec<Self>> {
        &cache.prompts
    }

    fn slot_mut(cache: &mut CapabilityCache) -> &mut Option<Vec<Self>> {
        &mut cache.prompts
    }

    fn fetch(session: Arc<Session>, timeout: Duration) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { session.client.list_prompts(timeout).await }.boxed()
    }
}

impl CachedListing for McpResource {
    const KIND: CapabilityKind = CapabilityKind::Resources;

    fn slot(cache: &CapabilityCache) -> &Option<Vec<Self>> {
        &cache.resources
    }

    fn slot_mut(cache: &mut CapabilityCache) -> &mut Option<Vec<Self>> {
        &mut cache.resources
    }

    fn fetch(session: Arc<Session>, timeout: Duration) -> BoxFuture<'static, Result<Vec<Self>>> {
        async move { session.client.list_resources(timeout).await }.boxed()
    }
}

struct ConnectionInner {
    descriptor: ServerDescriptor,
    category: TimeoutCategory,
    timeout: Duration,
    options: ConnectionOptions,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    cache: Arc<RwLock<CapabilityCache>>,
    pending: Mutex<Option<ConnectAttempt>>,
    generation: AtomicU64,
    /// Bumped by every disconnect; an attempt started under an older value
    /// must not install its session.
    epoch: AtomicU64,
    changes: broadcast::Sender<CapabilityKind>,
    last_error: RwLock<Option<String>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct McpConnection {
    inner: Arc<ConnectionInner>,
}

/// A handle that does not keep the connection alive.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<McpConnection> {
        self.0.upgrade().map(|inner| McpConnection { inner })
    }
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("server", &self.inner.descriptor.name)
            .field("state", &self.state())
            .field("category", &self.inner.category)
            .finish()
    }
}

impl McpConnection {
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self::with_options(descriptor, ConnectionOptions::default())
    }

    pub fn with_options(descriptor: ServerDescriptor, options: ConnectionOptions) -> Self {
        let category = TimeoutCategory::classify(&descriptor);
        let timeout = effective_timeout(&descriptor, category);
        debug!(
            "MCP server '{}' classified as {} ({}ms)",
            descriptor.name,
            category,
            timeout.as_millis()
        );
        let (changes, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ConnectionInner {
                descriptor,
                category,
                timeout,
                options,
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(None),
                cache: Arc::new(RwLock::new(CapabilityCache::default())),
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                changes,
                last_error: RwLock::new(None),
                connected_at: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.inner.descriptor
    }

    pub fn category(&self) -> TimeoutCategory {
        self.inner.category
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.inner.current_session().map(|s| s.server_info.clone())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.inner.current_session().map(|s| s.capabilities.clone())
    }

    /// Kinds the server reported as changed through a `list_changed`
    /// notification. The cache for that kind is already dropped when the
    /// event arrives.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CapabilityKind> {
        self.inner.changes.subscribe()
    }

    /// Forget every cached listing; the next listing goes to the server.
    pub fn invalidate_cache(&self) {
        *self.inner.cache.write() = CapabilityCache::default();
        debug!("Capability cache of '{}' invalidated", self.name());
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    /// True when both handles share one connection.
    pub(crate) fn same_as(&self, other: &McpConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Establish the session. Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut pending = self.inner.pending.lock();
            if self.state() == ConnectionState::Connected {
                return Ok(());
            }
            match pending.as_ref() {
                Some(attempt) => {
                    debug!("Joining in-flight connect to '{}'", self.name());
                    attempt.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let epoch = inner.epoch.load(Ordering::SeqCst);
                    let attempt = async move {
                        let result = inner.establish(epoch).await;
                        let mut pending = inner.pending.lock();
                        if inner.epoch.load(Ordering::SeqCst) == epoch {
                            pending.take();
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Drop the session. A connect still in flight is abandoned and its
    /// session, if it completes, is closed instead of installed.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.cancel_pending();
        let session = self.inner.session.write().take();
        self.inner.transition(ConnectionState::Disconnected);
        if let Some(session) = session {
            info!("Disconnecting MCP server '{}'", self.name());
            session.client.disconnect().await?;
        }
        Ok(())
    }

    /// Ask the server to drop its session, then disconnect. Servers without
    /// a session concept are simply disconnected.
    pub async fn terminate_session(&self) -> Result<()> {
        self.inner.cancel_pending();
        let session = self.inner.session.write().take();
        self.inner.transition(ConnectionState::Disconnected);
        match session {
            Some(session) => {
                info!("Terminating session with MCP server '{}'", self.name());
                session.client.terminate_session().await
            }
            None => Ok(()),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.listing::<McpTool>().await
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        self.listing::<McpPrompt>().await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        self.listing::<McpResource>().await
    }

    /// Cached tools, without touching the network.
    pub fn cached_tools(&self) -> Option<Vec<McpTool>> {
        let session = self.inner.current_session()?;
        self.inner.cached::<McpTool>(session.generation)
    }

    /// Execute a tool. Calls are never retried.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult> {
        let session = self.session().await?;
        debug!("Calling tool '{}' on MCP server '{}'", name, self.name());
        match session
            .client
            .call_tool(name, arguments, self.inner.timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Err(self.call_failed(&session, name, e)),
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<McpPromptResult> {
        let session = self.session().await?;
        match session
            .client
            .get_prompt(name, arguments, self.inner.timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Err(self.call_failed(&session, name, e)),
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContents>> {
        let session = self.session().await?;
        match session.client.read_resource(uri, self.inner.timeout).await {
            Ok(contents) => Ok(contents),
            Err(e) => Err(self.call_failed(&session, uri, e)),
        }
    }

    /// Round-trip a ping on the live session.
    pub async fn ping(&self) -> Result<()> {
        let session = self.session().await?;
        session.client.ping(self.inner.timeout).await
    }

    /// Probe liveness. A dead subprocess or a closed transport moves the
    /// connection to `Failed` and clears its cache.
    pub async fn check_health(&self) -> Result<()> {
        let Some(session) = self.inner.current_session() else {
            return Ok(());
        };
        let Some(reason) = self.inner.unhealthy_reason(&session) else {
            return Ok(());
        };
        warn!("MCP server '{}' is unhealthy: {}", self.name(), reason);
        if let Some(stale) =
            self.inner
                .retire(session.generation, ConnectionState::Failed, Some(reason.clone()))
        {
            if let Err(e) = stale.client.disconnect().await {
                debug!("Cleanup after unhealthy '{}' failed: {}", self.name(), e);
            }
        }
        Err(McpError::ProcessHealth {
            server: self.name().to_string(),
            reason,
        })
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        // A process that died since the last look is noticed here.
        if let Some(session) = self.inner.current_session() {
            if let Some(reason) = self.inner.unhealthy_reason(&session) {
                warn!("MCP server '{}' is unhealthy: {}", self.name(), reason);
                self.inner
                    .retire(session.generation, ConnectionState::Failed, Some(reason));
            }
        }

        let state = self.state();
        let session = self.inner.current_session();
        let process = session.as_ref().and_then(|s| s.process.clone());
        let process_status = process.as_ref().map(|p| p.status());
        let healthy = state == ConnectionState::Connected
            && process_status.map_or(true, |s| s.is_alive())
            && session.as_ref().map_or(false, |s| !s.client.is_closed());

        ConnectionStatus {
            server: self.name().to_string(),
            state,
            transport: self.inner.descriptor.kind(),
            category: self.inner.category,
            timeout_ms: self.inner.timeout.as_millis() as u64,
            healthy,
            lazy_pending: self.inner.descriptor.is_lazy() && state != ConnectionState::Connected,
            pid: process.as_ref().and_then(|p| p.pid()),
            process: process_status,
            server_name: session.as_ref().map(|s| s.server_info.name.clone()),
            last_error: self.inner.last_error.read().clone(),
            connected_at: *self.inner.connected_at.read(),
            cached_tools: session
                .as_ref()
                .and_then(|s| self.inner.cached::<McpTool>(s.generation))
                .map(|tools| tools.len()),
        }
    }

    /// The live session, connecting first for lazy servers.
    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.inner.current_session() {
            return Ok(session);
        }
        if !self.inner.descriptor.is_lazy() {
            return Err(McpError::NotConnected(self.name().to_string()));
        }
        debug!("Opening deferred session with MCP server '{}'", self.name());
        self.connect().await?;
        self.inner
            .current_session()
            .ok_or_else(|| McpError::NotConnected(self.name().to_string()))
    }

    fn call_failed(&self, session: &Arc<Session>, target: &str, error: McpError) -> McpError {
        match error {
            McpError::Disconnected | McpError::SessionExpired(_) => {
                warn!(
                    "MCP server '{}' went away during '{}': {}",
                    self.name(),
                    target,
                    error
                );
                self.inner.retire(
                    session.generation,
                    ConnectionState::Failed,
                    Some(error.to_string()),
                );
                error
            }
            McpError::Timeout(_) => {
                warn!("'{}' on MCP server '{}' timed out", target, self.name());
                error
            }
            McpError::JsonRpc { code, message } => McpError::ToolExecution {
                server: self.name().to_string(),
                tool: target.to_string(),
                message: format!("{} (code {})", message, code),
            },
            other => other,
        }
    }

    async fn listing<T: CachedListing>(&self) -> Result<Vec<T>> {
        let session = self.session().await?;
        match self.fetch_listing::<T>(&session).await {
            Err(e) if e.is_transient() => {
                warn!(
                    "Listing {} on '{}' failed ({}), reconnecting once",
                    T::KIND,
                    self.name(),
                    e
                );
                if let Some(stale) =
                    self.inner
                        .retire(session.generation, ConnectionState::Disconnected, None)
                {
                    if let Err(e) = stale.client.disconnect().await {
                        debug!("Dropping stale session of '{}' failed: {}", self.name(), e);
                    }
                }
                self.connect().await?;
                let session = self.session().await?;
                self.fetch_listing::<T>(&session).await
            }
            other => other,
        }
    }

    async fn fetch_listing<T: CachedListing>(&self, session: &Arc<Session>) -> Result<Vec<T>> {
        if let Some(cached) = self.inner.cached::<T>(session.generation) {
            return Ok(cached);
        }
        if !session.capabilities.supports(T::KIND) {
            debug!("MCP server '{}' does not advertise {}", self.name(), T::KIND);
            self.inner.store::<T>(session.generation, Vec::new());
            return Ok(Vec::new());
        }

        let label = format!("{} listing on '{}'", T::KIND, self.name());
        let timeout = self.inner.timeout;
        let fetched = retry_with_backoff(&self.inner.options.listing_policy, &label, |_| {
            T::fetch(session.clone(), timeout)
        })
        .await;

        match fetched {
            Ok(items) => {
                debug!("MCP server '{}' lists {} {}", self.name(), items.len(), T::KIND);
                self.inner.store::<T>(session.generation, items.clone());
                Ok(items)
            }
            Err(e) if e.is_unsupported() => {
                debug!("MCP server '{}' does not implement {}: {}", self.name(), T::KIND, e);
                self.inner.store::<T>(session.generation, Vec::new());
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

impl ConnectionInner {
    fn current_session(&self) -> Option<Arc<Session>> {
        if *self.state.read() != ConnectionState::Connected {
            return None;
        }
        self.session.read().clone()
    }

    fn cancel_pending(&self) {
        let mut pending = self.pending.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if pending.take().is_some() {
            debug!("Abandoning in-flight connect to '{}'", self.descriptor.name);
        }
    }

    fn abandoned(&self) -> McpError {
        McpError::Connection(format!(
            "connect to '{}' was abandoned by a disconnect",
            self.descriptor.name
        ))
    }

    fn transition(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            debug!("MCP server '{}': {} -> {}", self.descriptor.name, previous, next);
        }
        if next != ConnectionState::Connected {
            *self.cache.write() = CapabilityCache::default();
        }
    }

    /// Drop the session with the given generation, if it is still current.
    fn retire(
        &self,
        generation: u64,
        next: ConnectionState,
        reason: Option<String>,
    ) -> Option<Arc<Session>> {
        let retired = {
            let mut slot = self.session.write();
            match slot.as_ref() {
                Some(session) if session.generation == generation => slot.take(),
                _ => None,
            }
        };
        if retired.is_some() {
            if let Some(reason) = reason {
                *self.last_error.write() = Some(reason);
            }
            self.transition(next);
        }
        retired
    }

    fn unhealthy_reason(&self, session: &Session) -> Option<String> {
        if let Some(process) = &session.process {
            if !process.is_alive() {
                return Some(match process.status() {
                    ProcessStatus::Exited { code: Some(code) } => {
                        format!("process {:?} exited with code {}", process.pid(), code)
                    }
                    ProcessStatus::Exited { code: None } => {
                        format!("process {:?} was killed by a signal", process.pid())
                    }
                    _ => format!("process {:?} is no longer running", process.pid()),
                });
            }
        }
        if session.client.is_closed() {
            return Some("transport closed".to_string());
        }
        None
    }

    fn cached<T: CachedListing>(&self, generation: u64) -> Option<Vec<T>> {
        let cache = self.cache.read();
        if cache.generation != generation {
            return None;
        }
        T::slot(&cache).clone()
    }

    fn store<T: CachedListing>(&self, generation: u64, items: Vec<T>) {
        let current = self
            .current_session()
            .map_or(false, |s| s.generation == generation);
        if !current {
            return;
        }
        let mut cache = self.cache.write();
        if cache.generation != generation {
            *cache = CapabilityCache {
                generation,
                ..Default::default()
            };
        }
        *T::slot_mut(&mut cache) = Some(items);
    }

    /// Open a session under `epoch`. The epoch is re-checked under the
    /// session lock, the same lock `disconnect` takes after bumping it.
    async fn establish(&self, epoch: u64) -> Result<()> {
        {
            let _slot = self.session.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(self.abandoned());
            }
            self.transition(ConnectionState::Connecting);
        }

        let opened = match self.descriptor.kind() {
            TransportKind::Process => self.open_with_retry().await,
            _ => self.open_session().await,
        };

        match opened {
            Ok(mut session) => {
                session.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let session = Arc::new(session);
                let installed = {
                    let mut slot = self.session.write();
                    if self.epoch.load(Ordering::SeqCst) == epoch {
                        *slot = Some(session.clone());
                        *self.connected_at.write() = Some(Utc::now());
                        *self.last_error.write() = None;
                        self.transition(ConnectionState::Connected);
                        true
                    } else {
                        false
                    }
                };
                if !installed {
                    info!(
                        "Connect to MCP server '{}' finished after a disconnect, closing it",
                        self.descriptor.name
                    );
                    if let Err(e) = session.client.disconnect().await {
                        debug!("Closing abandoned session of '{}' failed: {}", self.descriptor.name, e);
                    }
                    return Err(self.abandoned());
                }
                info!(
                    "Connected to MCP server '{}' ({} v{})",
                    self.descriptor.name, session.server_info.name, session.server_info.version
                );
                Ok(())
            }
            Err(e) => {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("Abandoned connect to '{}' failed: {}", self.descriptor.name, e);
                    return Err(self.abandoned());
                }
                error!("Failed to connect to MCP server '{}': {}", self.descriptor.name, e);
                *self.last_error.write() = Some(e.to_string());
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Spawn with backoff. Missing executables and permission problems fail
    /// on the first attempt.
    async fn open_with_retry(&self) -> Result<Session> {
        let policy = RetryPolicy::new(
            self.category.max_connect_attempts(),
            self.options.connect_base_delay,
            self.options.connect_max_delay,
        )
        .with_predicate(|e| match e {
            McpError::SpawnFailed { kind, .. } => kind.is_retryable(),
            McpError::Unauthorized(_) | McpError::InvalidConfig(_) => false,
            _ => true,
        });
        let attempts = AtomicU32::new(0);
        let label = format!("Connect to '{}'", self.descriptor.name);

        let result = retry_with_backoff(&policy, &label, |attempt| {
            attempts.store(attempt, Ordering::SeqCst);
            self.open_session()
        })
        .await;

        result.map_err(|e| match e {
            e @ McpError::SpawnFailed { .. } if !policy.is_retryable(&e) => e,
            reason => McpError::ConnectFailed {
                server: self.descriptor.name.clone(),
                category: self.category,
                attempts: attempts.load(Ordering::SeqCst),
                reason: Box::new(reason),
            },
        })
    }

    /// One transport plus handshake, bounded by the connection timeout.
    async fn open_session(&self) -> Result<Session> {
        let transport = self.options.factory.create(&self.descriptor, self.timeout)?;
        let mut client = McpProtocolClient::new(transport);
        let cache = self.cache.clone();
        let changes = self.changes.clone();
        let server = self.descriptor.name.clone();
        client.set_notification_handler(Arc::new(move |notification| {
            match CapabilityKind::from_list_changed(&notification.method) {
                Some(kind) => {
                    info!("MCP server '{}' changed its {}", server, kind);
                    cache.write().forget(kind);
                    let _ = changes.send(kind);
                }
                None => debug!("Ignoring '{}' from '{}'", notification.method, server),
            }
        }));

        let handshake = tokio::time::timeout(self.timeout, async {
            client.connect().await?;
            client.initialize(self.timeout).await
        })
        .await;

        let initialized = match handshake {
            Ok(Ok(initialized)) => initialized,
            Ok(Err(e)) => {
                let _ = client.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                let _ = client.disconnect().await;
                return Err(McpError::Timeout(format!(
                    "Handshake with MCP server '{}' timed out after {}ms",
                    self.descriptor.name,
                    self.timeout.as_millis()
                )));
            }
        };

        let process = client.process();
        Ok(Session {
            client,
            capabilities: initialized.capabilities,
            server_info: initialized.server_info,
            process,
            generation: 0,
        })
    }
}
