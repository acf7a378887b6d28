use thiserror::Error;

use crate::timeouts::TimeoutCategory;

/// Why a subprocess could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    NotFound,
    PermissionDenied,
    Other,
}

impl SpawnErrorKind {
    pub fn from_io(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => SpawnErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => SpawnErrorKind::PermissionDenied,
            _ => SpawnErrorKind::Other,
        }
    }

    /// Missing executables and permission problems do not fix themselves.
    pub fn is_retryable(self) -> bool {
        matches!(self, SpawnErrorKind::Other)
    }
}

impl std::fmt::Display for SpawnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnErrorKind::NotFound => write!(f, "executable not found"),
            SpawnErrorKind::PermissionDenied => write!(f, "permission denied"),
            SpawnErrorKind::Other => write!(f, "spawn failed"),
        }
    }
}

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC "invalid request".
pub const INVALID_REQUEST: i32 = -32600;
/// JSON-RPC "invalid params".
pub const INVALID_PARAMS: i32 = -32602;

#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i32, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error(
        "Failed to connect to MCP server '{server}' ({category} timeout class) after {attempts} attempt(s): {reason}"
    )]
    ConnectFailed {
        server: String,
        category: TimeoutCategory,
        attempts: u32,
        reason: Box<McpError>,
    },

    #[error("Failed to spawn MCP server '{server}' ({kind}): {message}")]
    SpawnFailed {
        server: String,
        kind: SpawnErrorKind,
        message: String,
    },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("MCP server '{0}' is not connected")]
    NotConnected(String),

    #[error("MCP server '{server}' does not support {capability}")]
    CapabilityUnsupported { server: String, capability: String },

    #[error("Tool '{tool}' failed on MCP server '{server}': {message}")]
    ToolExecution {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Capability '{name}' from '{server}' conflicts with the one registered by '{existing_server}'")]
    Conflict {
        name: String,
        existing_server: String,
        server: String,
    },

    #[error("MCP server '{server}' process is unhealthy: {reason}")]
    ProcessHealth { server: String, reason: String },

    #[error("Bring-up aborted by strict server '{server}': {reason}")]
    BringUpAborted { server: String, reason: Box<McpError> },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Server disconnected")]
    Disconnected,

    #[error("Server already running: {0}")]
    AlreadyRunning(String),
}

impl McpError {
    /// Errors that look like a flaky network or a dropped session rather than
    /// a real answer from the server.
    pub fn is_transient(&self) -> bool {
        match self {
            McpError::Timeout(_)
            | McpError::Transport(_)
            | McpError::Connection(_)
            | McpError::Disconnected
            | McpError::SessionExpired(_) => true,
            McpError::Protocol(message) => transient_shape(message),
            _ => false,
        }
    }

    /// A "this server simply doesn't do that" answer.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            McpError::CapabilityUnsupported { .. }
                | McpError::JsonRpc {
                    code: METHOD_NOT_FOUND,
                    ..
                }
        )
    }
}

/// Free-text classification for errors that arrive as plain messages.
pub(crate) fn transient_shape(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "timeout",
        "timed out",
        "connection",
        "reset",
        "closed",
        "refused",
        "broken pipe",
        "eof",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

pub(crate) fn terminal_shape(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["validation", "invalid", "unauthorized", "forbidden"]
        .iter()
        .any(|needle| message.contains(needle))
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            McpError::Timeout(e.to_string())
        } else if e.is_connect() {
            McpError::Connection(e.to_string())
        } else {
            McpError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
