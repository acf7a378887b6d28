use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{McpContentItem, McpPrompt, McpPromptMessage, McpResource, McpResourceContents};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

// JSON-RPC 2.0 base types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Anything a server can send us.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    /// Server-initiated request, e.g. `ping`
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl IncomingMessage {
    pub fn parse(message: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(message)?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
        match (has_method, has_id) {
            (true, true) => Ok(IncomingMessage::Request(serde_json::from_value(value)?)),
            (true, false) => Ok(IncomingMessage::Notification(serde_json::from_value(value)?)),
            _ => Ok(IncomingMessage::Response(serde_json::from_value(value)?)),
        }
    }
}

// MCP Protocol types

/// Initialize request sent by client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInitializeRequest {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl Default for McpInitializeRequest {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "mcp-hub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Initialize result from server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    pub fn supports(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::Tools => self.tools.is_some(),
            CapabilityKind::Prompts => self.prompts.is_some(),
            CapabilityKind::Resources => self.resources.is_some(),
        }
    }
}

/// The three listable capability kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tools,
    Prompts,
    Resources,
}

impl CapabilityKind {
    pub fn list_method(self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools/list",
            CapabilityKind::Prompts => "prompts/list",
            CapabilityKind::Resources => "resources/list",
        }
    }

    /// The kind a `notifications/*/list_changed` notification refers to.
    pub fn from_list_changed(method: &str) -> Option<Self> {
        match method {
            "notifications/tools/list_changed" => Some(CapabilityKind::Tools),
            "notifications/prompts/list_changed" => Some(CapabilityKind::Prompts),
            "notifications/resources/list_changed" => Some(CapabilityKind::Resources),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Tools => write!(f, "tools"),
            CapabilityKind::Prompts => write!(f, "prompts"),
            CapabilityKind::Resources => write!(f, "resources"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Cursor-paginated request shared by the list methods
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginatedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolListResult {
    pub tools: Vec<McpToolInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpPromptListResult {
    pub prompts: Vec<McpPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceListResult {
    pub resources: Vec<McpResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Tool call request/result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCallRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolCallResult {
    #[serde(default)]
    pub content: Vec<McpContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpGetPromptRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpGetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<McpPromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpReadResourceRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpReadResourceResult {
    pub contents: Vec<McpResourceContents>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incoming_kinds() {
        let response = IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert!(matches!(response, IncomingMessage::Response(r) if r.id == 3));

        let request =
            IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#).unwrap();
        assert!(matches!(request, IncomingMessage::Request(r) if r.method == "ping"));

        let notification = IncomingMessage::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert!(matches!(notification, IncomingMessage::Notification(_)));
    }

    #[test]
    fn test_initialize_result_without_capabilities() {
        let json = r#"{
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "bare", "version": "0.1"}
        }"#;
        let result: McpInitializeResult = serde_json::from_str(json).unwrap();
        assert!(!result.capabilities.supports(CapabilityKind::Tools));
        assert!(!result.capabilities.supports(CapabilityKind::Prompts));
    }

    #[test]
    fn test_capability_flags() {
        let json = r#"{"tools": {}, "resources": {"subscribe": true}}"#;
        let caps: ServerCapabilities = serde_json::from_str(json).unwrap();
        assert!(caps.supports(CapabilityKind::Tools));
        assert!(caps.supports(CapabilityKind::Resources));
        assert!(!caps.supports(CapabilityKind::Prompts));
    }

    #[test]
    fn test_list_changed_methods() {
        assert_eq!(
            CapabilityKind::from_list_changed("notifications/prompts/list_changed"),
            Some(CapabilityKind::Prompts)
        );
        assert_eq!(
            CapabilityKind::from_list_changed("notifications/resources/list_changed"),
            Some(CapabilityKind::Resources)
        );
        assert_eq!(CapabilityKind::from_list_changed("notifications/progress"), None);
    }

    #[test]
    fn test_tool_list_with_cursor() {
        let json = r#"{
            "tools": [{"name": "read", "inputSchema": {"type": "object"}}],
            "nextCursor": "page-2"
        }"#;
        let result: McpToolListResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.tools[0].name, "read");
        assert!(result.tools[0].description.is_none());
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));
    }
}
