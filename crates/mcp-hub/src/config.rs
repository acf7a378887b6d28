use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{McpError, Result};

/// Root MCP configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl McpConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: McpConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file. A missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No MCP config at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        validate_descriptors(&self.servers)
    }
}

/// Connection bring-up policy for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// A failure aborts the whole bring-up.
    Strict,
    /// A failure is recorded and bring-up continues.
    #[default]
    Lenient,
}

/// Describes one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Unique identifier for this server
    pub name: String,
    /// Transport configuration
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Overrides the timeout picked by classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub connection_mode: ConnectionMode,
    /// Whether this server's capabilities are exposed at all
    #[serde(default = "default_true")]
    pub routing_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    pub fn process(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Process(ProcessConfig {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            }),
        )
    }

    pub fn event_stream(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::EventStream(EventStreamConfig {
                url: url.into(),
                headers: HashMap::new(),
            }),
        )
    }

    pub fn streamable(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Streamable(StreamableConfig {
                url: url.into(),
                headers: HashMap::new(),
                lazy_connect: true,
            }),
        )
    }

    pub fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_ms: None,
            connection_mode: ConnectionMode::default(),
            routing_enabled: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Streamable servers configured to defer the handshake.
    pub fn is_lazy(&self) -> bool {
        matches!(&self.transport, TransportConfig::Streamable(c) if c.lazy_connect)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::InvalidConfig("server name is empty".to_string()));
        }
        if self.name.contains("__") {
            return Err(McpError::InvalidConfig(format!(
                "server name '{}' must not contain '__'",
                self.name
            )));
        }
        match &self.transport {
            TransportConfig::Process(process) => {
                if process.command.trim().is_empty() {
                    return Err(McpError::InvalidConfig(format!(
                        "server '{}' has an empty command",
                        self.name
                    )));
                }
            }
            TransportConfig::EventStream(EventStreamConfig { url, .. })
            | TransportConfig::Streamable(StreamableConfig { url, .. }) => {
                url::Url::parse(url).map_err(|e| {
                    McpError::InvalidConfig(format!(
                        "server '{}' has an invalid url '{}': {}",
                        self.name, url, e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

fn validate_descriptors(servers: &[ServerDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for server in servers {
        server.validate()?;
        if !seen.insert(server.name.as_str()) {
            return Err(McpError::InvalidConfig(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }
    }
    Ok(())
}

/// Transport configuration variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transportKind", rename_all = "kebab-case")]
pub enum TransportConfig {
    Process(ProcessConfig),
    EventStream(EventStreamConfig),
    #[serde(rename = "streamable-bidirectional")]
    Streamable(StreamableConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Process(_) => TransportKind::Process,
            TransportConfig::EventStream(_) => TransportKind::EventStream,
            TransportConfig::Streamable(_) => TransportKind::Streamable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Process,
    EventStream,
    #[serde(rename = "streamable-bidirectional")]
    Streamable,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Process => write!(f, "process"),
            TransportKind::EventStream => write!(f, "event-stream"),
            TransportKind::Streamable => write!(f, "streamable-bidirectional"),
        }
    }
}

/// Process transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments for the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Event-stream (HTTP + SSE) transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStreamConfig {
    /// SSE endpoint URL
    pub url: String,
    /// Additional headers, typically for authentication
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Streamable HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamableConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Defer the handshake until the first real operation
    #[serde(default = "default_true")]
    pub lazy_connect: bool,
}

/// How the aggregator treats two servers exposing the same name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Rename the later capability to `{server}.{name}`.
    #[default]
    Prefix,
    /// Keep the earliest registration, skip the rest.
    FirstWins,
    /// Refuse to build the namespace.
    Error,
}

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    /// Call-level timeout, layered on top of each server's own
    #[serde(default = "default_aggregator_timeout")]
    pub timeout_ms: u64,
}

fn default_aggregator_timeout() -> u64 {
    60000 // 60 seconds
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            conflict_resolution: ConflictResolution::default(),
            timeout_ms: default_aggregator_timeout(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        validate_descriptors(&self.servers)
    }
}
