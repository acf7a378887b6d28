//! Streamable HTTP transport.
//!
//! Every outbound message is its own POST. The server answers with plain JSON,
//! with an event stream carrying one or more messages, or with 202 for
//! notifications. The session id handed out on `initialize` travels in the
//! `Mcp-Session-Id` header until the session is terminated with `DELETE`.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::StreamableConfig;
use crate::error::{McpError, Result};
use crate::protocol::client::McpTransport;
use crate::transports::{build_header_map, status_error};

pub const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    server: String,
    config: StreamableConfig,
    headers: HeaderMap,
    client: Client,
    request_timeout: Duration,
    connected: AtomicBool,
    session_id: RwLock<Option<String>>,
    message_tx: mpsc::Sender<String>,
    message_rx: Mutex<mpsc::Receiver<String>>,
    streams: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    pub fn new(
        server: impl Into<String>,
        config: StreamableConfig,
        request_timeout: Duration,
    ) -> Result<Self> {
        let headers = build_header_map(&config.headers)?;
        let (message_tx, message_rx) = mpsc::channel(100);
        Ok(Self {
            server: server.into(),
            config,
            headers,
            client: Client::new(),
            request_timeout,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
            message_tx,
            message_rx: Mutex::new(message_rx),
            streams: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn remember_session(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            let mut session = self.session_id.write();
            if session.as_deref() != Some(id) {
                debug!("MCP server '{}' assigned session {}", self.server, id);
                *session = Some(id.to_string());
            }
        }
    }

    /// Forward a JSON body (single message or batch) to the receive queue.
    async fn forward_json(&self, body: &str) -> Result<()> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<serde_json::Value>(body)? {
            serde_json::Value::Array(batch) => {
                for message in batch {
                    self.push(message.to_string()).await?;
                }
            }
            message => self.push(message.to_string()).await?,
        }
        Ok(())
    }

    async fn push(&self, message: String) -> Result<()> {
        self.message_tx
            .send(message)
            .await
            .map_err(|_| McpError::Disconnected)
    }

    fn forward_stream(&self, response: Response) {
        let message_tx = self.message_tx.clone();
        let server = self.server.clone();
        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) if event.event == "message" || event.event.is_empty() => {
                        if event.data.trim().is_empty() {
                            continue;
                        }
                        if message_tx.send(event.data).await.is_err() {
                            break;
                        }
                    }
                    Ok(event) => debug!("Ignoring SSE event '{}' from '{}'", event.event, server),
                    Err(e) => {
                        warn!("Streamed response from '{}' broke off: {}", server, e);
                        break;
                    }
                }
            }
        });
        let mut streams = self.streams.lock();
        streams.retain(|h| !h.is_finished());
        streams.push(handle);
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&mut self) -> Result<()> {
        // The session is opened by the initialize POST itself.
        info!("MCP streamable transport ready for {}", self.config.url);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting MCP streamable transport for '{}'", self.server);
        self.connected.store(false, Ordering::SeqCst);
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        *self.session_id.write() = None;
        Ok(())
    }

    async fn terminate_session(&mut self) -> Result<()> {
        let Some(session) = self.session_id() else {
            debug!("MCP server '{}' has no session to terminate", self.server);
            return Ok(());
        };

        info!("Terminating MCP session {} on '{}'", session, self.server);
        let response = self
            .client
            .delete(&self.config.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, &session)
            .timeout(self.request_timeout)
            .send()
            .await?;

        *self.session_id.write() = None;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            debug!("MCP server '{}' does not allow session termination", self.server);
            return Ok(());
        }
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let session = self.session_id();
        let mut request = self
            .client
            .post(&self.config.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(message);
        if let Some(session) = &session {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND && session.is_some() {
            *self.session_id.write() = None;
            return Err(McpError::SessionExpired(format!(
                "MCP server '{}' no longer knows session",
                self.server
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        self.remember_session(&response);

        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            self.forward_stream(response);
            Ok(())
        } else {
            let body = response.text().await?;
            self.forward_json(&body).await
        }
    }

    async fn receive(&self) -> Result<Option<String>> {
        let mut rx = self.message_rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(McpError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> StreamableHttpTransport {
        StreamableHttpTransport::new(
            "remote",
            StreamableConfig {
                url: "http://127.0.0.1:1/mcp".to_string(),
                headers: Default::default(),
                lazy_connect: true,
            },
            Duration::from_millis(200),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_batch_body_is_split() {
        let transport = transport();
        transport
            .forward_json(r#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","id":2,"result":{}}]"#)
            .await
            .unwrap();
        let first = transport.receive().await.unwrap().unwrap();
        let second = transport.receive().await.unwrap().unwrap();
        assert!(first.contains("\"id\":1"));
        assert!(second.contains("\"id\":2"));
    }

    #[tokio::test]
    async fn test_terminate_without_session_is_noop() {
        let mut transport = transport();
        transport.connect().await.unwrap();
        transport.terminate_session().await.unwrap();
        assert!(transport.session_id().is_none());
    }
}
