use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, warn};

use crate::error::{McpError, Result, METHOD_NOT_FOUND};
use crate::protocol::models::*;
use crate::transports::ProcessHandle;
use crate::types::{McpCallResult, McpPrompt, McpPromptResult, McpResource, McpResourceContents, McpTool};

/// Guard against servers that hand out cursors forever.
const MAX_LIST_PAGES: usize = 64;

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn send(&self, message: String) -> Result<()>;
    async fn receive(&self) -> Result<Option<String>>;
    fn is_connected(&self) -> bool;

    /// Ask the server to drop its session state. Transports without a
    /// server-side session have nothing to do.
    async fn terminate_session(&mut self) -> Result<()> {
        Ok(())
    }

    /// The subprocess behind this transport, if there is one.
    fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        None
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>;

/// Called on the reader task for every server notification.
pub type NotificationHandler = Arc<dyn Fn(&JsonRpcNotification) + Send + Sync>;

/// MCP protocol client
pub struct McpProtocolClient {
    transport: Arc<RwLock<Box<dyn McpTransport>>>,
    next_id: AtomicU64,
    pending_requests: Arc<RwLock<PendingMap>>,
    message_handler: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    process: Option<Arc<dyn ProcessHandle>>,
    notification_handler: Option<NotificationHandler>,
}

impl McpProtocolClient {
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport: Arc::new(RwLock::new(transport)),
            next_id: AtomicU64::new(1),
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
            message_handler: parking_lot::Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            process: None,
            notification_handler: None,
        }
    }

    /// Install before `connect`; the reader task picks it up when it starts.
    pub fn set_notification_handler(&mut self, handler: NotificationHandler) {
        self.notification_handler = Some(handler);
    }

    pub async fn connect(&mut self) -> Result<()> {
        let mut transport = self.transport.write().await;
        transport.connect().await?;
        self.process = transport.process();
        drop(transport);

        self.closed.store(false, Ordering::SeqCst);
        self.start_message_handler();

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let handler = self.message_handler.lock().take();
        if let Some(handler) = handler {
            handler.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        Self::fail_pending(&self.pending_requests).await;

        let mut transport = self.transport.write().await;
        transport.disconnect().await
    }

    /// Tell the server to release the session, then release local resources.
    pub async fn terminate_session(&self) -> Result<()> {
        let terminated = {
            let mut transport = self.transport.write().await;
            transport.terminate_session().await
        };
        let disconnected = self.disconnect().await;
        terminated.and(disconnected)
    }

    /// True once the reader task has stopped or `disconnect` ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.process.clone()
    }

    fn start_message_handler(&self) {
        let transport = self.transport.clone();
        let pending_requests = self.pending_requests.clone();
        let notification_handler = self.notification_handler.clone();
        let closed = self.closed.clone();

        let handler = tokio::spawn(async move {
            loop {
                let transport = transport.read().await;
                if !transport.is_connected() {
                    break;
                }

                let received = transport.receive().await;
                match received {
                    Ok(Some(message)) => {
                        debug!("Received message: {}", message);
                        if let Err(e) = Self::handle_message(
                            &message,
                            &**transport,
                            &pending_requests,
                            notification_handler.as_ref(),
                        )
                        .await
                        {
                            warn!("Failed to handle message: {}", e);
                        }
                    }
                    Ok(None) => {
                        drop(transport);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => {
                        error!("Transport error: {}", e);
                        break;
                    }
                }
            }

            closed.store(true, Ordering::SeqCst);
            Self::fail_pending(&pending_requests).await;
        });

        *self.message_handler.lock() = Some(handler);
    }

    async fn fail_pending(pending_requests: &RwLock<PendingMap>) {
        let mut pending = pending_requests.write().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(McpError::Disconnected));
        }
    }

    async fn handle_message(
        message: &str,
        transport: &dyn McpTransport,
        pending_requests: &RwLock<PendingMap>,
        notification_handler: Option<&NotificationHandler>,
    ) -> Result<()> {
        match IncomingMessage::parse(message)? {
            IncomingMessage::Response(response) => {
                let mut pending = pending_requests.write().await;
                match pending.remove(&response.id) {
                    Some(sender) => {
                        let _ = sender.send(Ok(response));
                    }
                    None => debug!("Dropping response for unknown request {}", response.id),
                }
            }
            IncomingMessage::Request(request) => {
                let reply = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    JsonRpcResponse::failure(
                        request.id,
                        METHOD_NOT_FOUND,
                        format!("Client does not handle '{}'", request.method),
                    )
                };
                transport.send(serde_json::to_string(&reply)?).await?;
            }
            IncomingMessage::Notification(notification) => match notification_handler {
                Some(handler) => handler(&notification),
                None => debug!("Ignoring notification '{}'", notification.method),
            },
        }
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(McpError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.write().await;
            pending.insert(id, tx);
        }

        let sent = {
            let transport = self.transport.read().await;
            transport.send(request_json).await
        };
        if let Err(e) = sent {
            self.pending_requests.write().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                if let Some(error) = response.error {
                    Err(McpError::JsonRpc {
                        code: error.code,
                        message: error.message,
                    })
                } else {
                    response
                        .result
                        .ok_or_else(|| McpError::Protocol("Missing result".to_string()))
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                self.pending_requests.write().await.remove(&id);
                Err(McpError::Timeout(format!(
                    "{} (request {}) timed out after {}ms",
                    method,
                    id,
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let transport = self.transport.read().await;
        transport.send(serde_json::to_string(&notification)?).await
    }

    pub async fn initialize(&self, timeout: Duration) -> Result<McpInitializeResult> {
        let request = McpInitializeRequest::default();
        let params = serde_json::to_value(request)?;

        let result = self.send_request("initialize", Some(params), timeout).await?;
        let result: McpInitializeResult = serde_json::from_value(result)?;

        self.notify("notifications/initialized", None).await?;

        Ok(result)
    }

    /// Follow `nextCursor` until the server stops handing one out.
    async fn list_paginated<R, T>(
        &self,
        kind: CapabilityKind,
        timeout: Duration,
        split: fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .take()
                .map(|c| serde_json::to_value(PaginatedRequest { cursor: Some(c) }))
                .transpose()?;
            let result = self.send_request(kind.list_method(), params, timeout).await?;
            let (page, next) = split(serde_json::from_value(result)?);
            items.extend(page);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        warn!("{} listing exceeded {} pages, truncating", kind, MAX_LIST_PAGES);
        Ok(items)
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        let tools = self
            .list_paginated(CapabilityKind::Tools, timeout, |r: McpToolListResult| {
                (r.tools, r.next_cursor)
            })
            .await?;

        Ok(tools
            .into_iter()
            .map(|t| McpTool {
                name: t.name,
                description: t.description.unwrap_or_default(),
                parameters: t
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            })
            .collect())
    }

    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<McpPrompt>> {
        self.list_paginated(CapabilityKind::Prompts, timeout, |r: McpPromptListResult| {
            (r.prompts, r.next_cursor)
        })
        .await
    }

    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<McpResource>> {
        self.list_paginated(CapabilityKind::Resources, timeout, |r: McpResourceListResult| {
            (r.resources, r.next_cursor)
        })
        .await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<McpCallResult> {
        let request = McpToolCallRequest {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let params = serde_json::to_value(request)?;

        let result = self.send_request("tools/call", Some(params), timeout).await?;
        let result: McpToolCallResult = serde_json::from_value(result)?;

        Ok(McpCallResult {
            content: result.content,
            is_error: result.is_error,
        })
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
        timeout: Duration,
    ) -> Result<McpPromptResult> {
        let request = McpGetPromptRequest {
            name: name.to_string(),
            arguments,
        };
        let params = serde_json::to_value(request)?;

        let result = self.send_request("prompts/get", Some(params), timeout).await?;
        let result: McpGetPromptResult = serde_json::from_value(result)?;

        Ok(McpPromptResult {
            description: result.description,
            messages: result.messages,
        })
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<Vec<McpResourceContents>> {
        let params = serde_json::to_value(McpReadResourceRequest {
            uri: uri.to_string(),
        })?;

        let result = self.send_request("resources/read", Some(params), timeout).await?;
        let result: McpReadResourceResult = serde_json::from_value(result)?;
        Ok(result.contents)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.send_request("ping", None, timeout).await?;
        Ok(())
    }
}

impl Drop for McpProtocolClient {
    fn drop(&mut self) {
        if let Some(handler) = self.message_handler.get_mut().take() {
            handler.abort();
        }
    }
}
