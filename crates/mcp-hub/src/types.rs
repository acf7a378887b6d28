use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TransportKind;
use crate::timeouts::TimeoutCategory;

/// MCP tool metadata from server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    /// Input schema, passed through untouched
    pub parameters: serde_json::Value,
}

/// Prompt template advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<McpPromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Resource advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Result of calling an MCP tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallResult {
    pub content: Vec<McpContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpCallResult {
    /// Text items joined by newlines, for callers that only want the words.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                McpContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: McpResourceContents },
}

/// Body of a resource, either text or base64 blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Rendered prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<McpPromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPromptMessage {
    pub role: String,
    pub content: McpContentItem,
}

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// What we know about a server subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    /// Exited on its own; `code` is absent when a signal ended it.
    Exited { code: Option<i32> },
    /// We could not query it at all.
    Unknown,
}

impl ProcessStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// Snapshot returned by `McpConnection::connection_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub server: String,
    pub state: ConnectionState,
    pub transport: TransportKind,
    pub category: TimeoutCategory,
    pub timeout_ms: u64,
    /// Connected and, for subprocesses, still alive
    pub healthy: bool,
    /// Handshake deferred until first use
    pub lazy_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tools: Option<usize>,
}

/// Entry in the orchestrator's failure table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub server: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of bringing up a configured server set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BringUpReport {
    pub connected: Vec<String>,
    /// Lazy servers registered without a handshake
    pub deferred: Vec<String>,
    pub failed: Vec<FailureRecord>,
    /// Servers with routing disabled
    pub skipped: Vec<String>,
}

/// Event emitted by MCP manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum McpEvent {
    ServerConnected {
        server_id: String,
    },
    ServerDisconnected {
        server_id: String,
    },
    ServerFailed {
        server_id: String,
        error: String,
    },
    ToolsChanged {
        tools: Vec<String>,
    },
    ToolExecuted {
        server_id: String,
        tool_name: String,
        success: bool,
    },
}
