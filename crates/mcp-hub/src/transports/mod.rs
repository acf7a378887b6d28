pub mod process;
pub mod sse;
pub mod stdio;
pub mod streamable;

pub use process::{ChildProcess, ProcessHandle};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{ServerDescriptor, TransportConfig};
use crate::error::{McpError, Result};
use crate::protocol::client::McpTransport;

/// Builds a fresh transport for every connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn McpTransport>>;
}

/// Picks the transport named by the descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        descriptor: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn McpTransport>> {
        let transport: Box<dyn McpTransport> = match &descriptor.transport {
            TransportConfig::Process(config) => {
                Box::new(StdioTransport::new(&descriptor.name, config.clone()))
            }
            TransportConfig::EventStream(config) => Box::new(SseTransport::new(
                &descriptor.name,
                config.clone(),
                timeout,
            )?),
            TransportConfig::Streamable(config) => Box::new(StreamableHttpTransport::new(
                &descriptor.name,
                config.clone(),
                timeout,
            )?),
        };
        Ok(transport)
    }
}

pub(crate) fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::InvalidConfig(format!("Invalid header name: {}", e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| McpError::InvalidConfig(format!("Invalid header value: {}", e)))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> McpError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            McpError::Unauthorized(format!("HTTP {}: {}", status, body))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            McpError::Timeout(format!("HTTP {}", status))
        }
        s if s.is_server_error() => McpError::Transport(format!("HTTP {}: {}", status, body)),
        _ => McpError::Protocol(format!("HTTP {}: {}", status, body)),
    }
}
