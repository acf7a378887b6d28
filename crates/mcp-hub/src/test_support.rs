//! Scriptable in-memory MCP server for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::config::ServerDescriptor;
use crate::error::{McpError, Result, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::protocol::models::{JsonRpcRequest, JsonRpcResponse};
use crate::protocol::McpTransport;
use crate::transports::{ProcessHandle, TransportFactory};
use crate::types::{McpPrompt, McpResource, McpTool};

/// How a fake server answers one of the optional listings.
#[derive(Clone)]
pub(crate) enum Listing<T> {
    /// Not advertised during the handshake.
    Absent,
    /// Advertised, but the list method answers "method not found".
    Unimplemented,
    Items(Vec<T>),
}

pub(crate) struct FakeServer {
    pub name: String,
    pub tools: Vec<McpTool>,
    pub prompts: Listing<McpPrompt>,
    pub resources: Listing<McpResource>,
    pub handshake_delay: Duration,
    pub call_delay: Duration,
    pub process: Option<Arc<dyn ProcessHandle>>,
    /// The next N transport connects fail with `connect_error`.
    pub failing_connects: AtomicU32,
    pub connect_error: parking_lot::Mutex<McpError>,
    /// The next N `tools/list` sends fail at the transport level.
    pub failing_lists: AtomicU32,
    pub transports_created: AtomicUsize,
    pub tool_lists: AtomicUsize,
    pub prompt_lists: AtomicUsize,
    pub resource_lists: AtomicUsize,
    pub terminations: AtomicUsize,
    pub calls: parking_lot::Mutex<Vec<(String, Value)>>,
    /// Tools added while the server runs.
    pub added_tools: parking_lot::Mutex<Vec<McpTool>>,
    /// Inbox of the most recently created transport.
    outbox: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            prompts: Listing::Absent,
            resources: Listing::Absent,
            handshake_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
            process: None,
            failing_connects: AtomicU32::new(0),
            connect_error: parking_lot::Mutex::new(McpError::Connection(
                "connection refused".to_string(),
            )),
            failing_lists: AtomicU32::new(0),
            transports_created: AtomicUsize::new(0),
            tool_lists: AtomicUsize::new(0),
            prompt_lists: AtomicUsize::new(0),
            resource_lists: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            calls: parking_lot::Mutex::new(Vec::new()),
            added_tools: parking_lot::Mutex::new(Vec::new()),
            outbox: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_tools(mut self, names: &[&str]) -> Self {
        self.tools = names.iter().map(|name| tool(name, &self.name)).collect();
        self
    }

    pub fn with_prompts(mut self, prompts: Listing<McpPrompt>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_resources(mut self, resources: Listing<McpResource>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ProcessHandle>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn failing_connects(self, count: u32, error: McpError) -> Self {
        self.failing_connects.store(count, Ordering::SeqCst);
        *self.connect_error.lock() = error;
        self
    }

    pub fn failing_lists(self, count: u32) -> Self {
        self.failing_lists.store(count, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Add a tool and tell the connected client its tool list changed.
    pub async fn announce_tool(&self, name: &str) {
        self.added_tools.lock().push(tool(name, &self.name));
        let outbox = self.outbox.lock().clone();
        if let Some(outbox) = outbox {
            let notification =
                json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" });
            let _ = outbox.send(notification.to_string()).await;
        }
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
            || self.added_tools.lock().iter().any(|t| t.name == name)
    }

    fn capabilities(&self) -> Value {
        let mut capabilities = json!({ "tools": {} });
        if !matches!(self.prompts, Listing::Absent) {
            capabilities["prompts"] = json!({});
        }
        if !matches!(self.resources, Listing::Absent) {
            capabilities["resources"] = json!({});
        }
        capabilities
    }

    fn answer(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        let params = request.params.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": self.capabilities(),
                    "serverInfo": { "name": format!("{}-server", self.name), "version": "1.0.0" }
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                self.tool_lists.fetch_add(1, Ordering::SeqCst);
                let added = self.added_tools.lock().clone();
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .chain(added.iter())
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.parameters,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "prompts/list" => {
                self.prompt_lists.fetch_add(1, Ordering::SeqCst);
                listing_response(id, &self.prompts, "prompts")
            }
            "resources/list" => {
                self.resource_lists.fetch_add(1, Ordering::SeqCst);
                listing_response(id, &self.resources, "resources")
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params["arguments"].clone();
                self.calls.lock().push((name.clone(), arguments));
                if self.has_tool(&name) {
                    JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{ "type": "text", "text": format!("{}:{}", self.name, name) }]
                        }),
                    )
                } else {
                    JsonRpcResponse::failure(id, INVALID_PARAMS, format!("Unknown tool: {}", name))
                }
            }
            "prompts/get" => {
                let name = params["name"].as_str().unwrap_or_default();
                JsonRpcResponse::success(
                    id,
                    json!({
                        "description": format!("{} prompt", name),
                        "messages": [{
                            "role": "user",
                            "content": { "type": "text", "text": format!("{}:{}", self.name, name) }
                        }]
                    }),
                )
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                JsonRpcResponse::success(
                    id,
                    json!({
                        "contents": [{ "uri": uri, "text": format!("{}:{}", self.name, uri) }]
                    }),
                )
            }
            other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Unknown method {}", other)),
        }
    }
}

fn listing_response<T: serde::Serialize>(id: u64, listing: &Listing<T>, key: &str) -> JsonRpcResponse {
    match listing {
        Listing::Items(items) => JsonRpcResponse::success(id, json!({ key: items })),
        _ => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, "Method not found"),
    }
}

pub(crate) fn tool(name: &str, server: &str) -> McpTool {
    McpTool {
        name: name.to_string(),
        description: format!("{} from {}", name, server),
        parameters: json!({ "type": "object", "properties": {} }),
    }
}

pub(crate) fn prompt(name: &str) -> McpPrompt {
    McpPrompt {
        name: name.to_string(),
        description: None,
        arguments: Vec::new(),
    }
}

pub(crate) fn resource(uri: &str, name: &str) -> McpResource {
    McpResource {
        uri: uri.to_string(),
        name: name.to_string(),
        description: None,
        mime_type: None,
    }
}

pub(crate) struct FakeTransport {
    server: Arc<FakeServer>,
    connected: AtomicBool,
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn connect(&mut self) -> Result<()> {
        if !self.server.handshake_delay.is_zero() {
            tokio::time::sleep(self.server.handshake_delay).await;
        }
        let failing = self
            .server
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.server.connect_error.lock().clone());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate_session(&mut self) -> Result<()> {
        self.server.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }
        let value: Value = serde_json::from_str(&message)?;
        if value.get("id").is_none() {
            return Ok(());
        }
        let request: JsonRpcRequest = serde_json::from_value(value)?;

        if request.method == "tools/list"
            && self
                .server
                .failing_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(McpError::Transport("connection reset by peer".to_string()));
        }

        let response = serde_json::to_string(&self.server.answer(&request))?;
        if request.method == "tools/call" && !self.server.call_delay.is_zero() {
            let tx = self.tx.clone();
            let delay = self.server.call_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(response).await;
            });
            return Ok(());
        }
        self.tx
            .send(response)
            .await
            .map_err(|_| McpError::Disconnected)
    }

    async fn receive(&self) -> Result<Option<String>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(McpError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.server.process.clone()
    }
}

/// Hands out fake transports, keyed by server name.
#[derive(Default)]
pub(crate) struct FakeTransportFactory {
    servers: HashMap<String, Arc<FakeServer>>,
}

impl FakeTransportFactory {
    pub fn new(servers: Vec<FakeServer>) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|s| (s.name.clone(), Arc::new(s)))
                .collect(),
        }
    }

    pub fn server(&self, name: &str) -> Arc<FakeServer> {
        self.servers[name].clone()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        descriptor: &ServerDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn McpTransport>> {
        let server = self
            .servers
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(descriptor.name.clone()))?;
        server.transports_created.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(100);
        *server.outbox.lock() = Some(tx.clone());
        Ok(Box::new(FakeTransport {
            server,
            connected: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
        }))
    }
}

/// A descriptor whose transport is irrelevant to the fake factory.
pub(crate) fn remote(name: &str) -> ServerDescriptor {
    ServerDescriptor::event_stream(name, format!("http://{}.invalid/sse", name))
}
