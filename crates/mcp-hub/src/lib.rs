//! MCP (Model Context Protocol) client orchestration
//!
//! Connects to any number of MCP servers over stdio, SSE or streamable HTTP,
//! keeps their capability listings cached, and exposes them either routed by
//! qualified name (`McpServerManager`) or merged into one namespace
//! (`McpAggregator`).

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod timeouts;
pub mod tool_index;
pub mod transports;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::{AggregatorStats, McpAggregator};
pub use config::*;
pub use connection::{ConnectionOptions, McpConnection};
pub use error::{McpError, Result, SpawnErrorKind};
pub use logging::init_logging;
pub use manager::McpServerManager;
pub use protocol::{McpProtocolClient, McpTransport};
pub use provider::McpCapabilities;
pub use registry::{CapabilityRegistry, RegistryBuilder, RegistryEntry};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use timeouts::TimeoutCategory;
pub use tool_index::{CapabilityIndex, CapabilityRoute, ServerListing};
pub use transports::*;
pub use types::*;
