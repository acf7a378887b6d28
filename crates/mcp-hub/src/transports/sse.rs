use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header::HeaderMap, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::EventStreamConfig;
use crate::error::{McpError, Result};
use crate::protocol::client::McpTransport;
use crate::transports::{build_header_map, status_error};

/// Legacy HTTP+SSE transport: server pushes over an event stream, the client
/// POSTs to the endpoint the stream announces.
pub struct SseTransport {
    server: String,
    config: EventStreamConfig,
    headers: HeaderMap,
    client: Client,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    message_tx: mpsc::Sender<String>,
    message_rx: Mutex<mpsc::Receiver<String>>,
    sse_handle: Option<tokio::task::JoinHandle<()>>,
    endpoint_tx: watch::Sender<Option<String>>,
}

impl SseTransport {
    pub fn new(
        server: impl Into<String>,
        config: EventStreamConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let headers = build_header_map(&config.headers)?;
        let (message_tx, message_rx) = mpsc::channel(100);
        let (endpoint_tx, _) = watch::channel(None);
        Ok(Self {
            server: server.into(),
            config,
            headers,
            client: Client::new(),
            connect_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            message_tx,
            message_rx: Mutex::new(message_rx),
            sse_handle: None,
            endpoint_tx,
        })
    }

    /// Where to POST when the server never announced an endpoint.
    fn fallback_endpoint(&self) -> String {
        format!("{}/message", self.config.url.trim_end_matches("/sse"))
    }

    async fn endpoint(&self) -> String {
        let mut rx = self.endpoint_tx.subscribe();
        let announced = tokio::time::timeout(self.connect_timeout, rx.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(|r| r.ok().and_then(|endpoint| (*endpoint).clone()));
        match announced {
            Some(endpoint) => endpoint,
            None => {
                let fallback = self.fallback_endpoint();
                warn!(
                    "MCP server '{}' announced no endpoint, posting to {}",
                    self.server, fallback
                );
                self.endpoint_tx.send_replace(Some(fallback.clone()));
                fallback
            }
        }
    }
}

/// Resolve the `endpoint` event payload against the stream URL.
fn resolve_endpoint(base: &str, announced: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(announced))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| announced.to_string())
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to MCP SSE endpoint: {}", self.config.url);

        // Only the response head is bounded; the body is the long-lived stream.
        let request = self
            .client
            .get(&self.config.url)
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "SSE stream for '{}' did not open within {:?}",
                    self.server, self.connect_timeout
                ))
            })??;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let message_tx = self.message_tx.clone();
        let endpoint_tx = self.endpoint_tx.clone();
        let connected = self.connected.clone();
        let url = self.config.url.clone();

        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        debug!("SSE event: {}", event.event);
                        if event.event == "endpoint" {
                            let endpoint = resolve_endpoint(&url, event.data.trim());
                            debug!("Got endpoint: {}", endpoint);
                            endpoint_tx.send_replace(Some(endpoint));
                        } else if (event.event == "message" || event.event.is_empty())
                            && message_tx.send(event.data).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("SSE stream error: {}", e);
                        break;
                    }
                }
            }
            warn!("SSE stream ended for {}", url);
            connected.store(false, Ordering::SeqCst);
        });

        self.sse_handle = Some(handle);
        self.connected.store(true, Ordering::SeqCst);

        info!("MCP SSE transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting MCP SSE transport");

        self.connected.store(false, Ordering::SeqCst);

        if let Some(handle) = self.sse_handle.take() {
            handle.abort();
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let post_url = self.endpoint().await;

        let response = self
            .client
            .post(&post_url)
            .headers(self.headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message)
            .timeout(self.connect_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        debug!("Sent message via POST to {}", post_url);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        let mut rx = self.message_rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(message)) => {
                debug!("Received SSE message: {}", message);
                Ok(Some(message))
            }
            Ok(None) => {
                warn!("SSE message channel closed");
                Err(McpError::Disconnected)
            }
            Err(_) => {
                if self.is_connected() {
                    Ok(None)
                } else {
                    Err(McpError::Disconnected)
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
