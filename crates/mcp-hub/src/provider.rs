use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::connection::McpConnection;
use crate::error::Result;
use crate::types::{
    McpCallResult, McpPrompt, McpPromptResult, McpResource, McpResourceContents, McpTool,
};

/// Anything that exposes MCP capabilities: a single server connection or an
/// aggregate of many.
#[async_trait]
pub trait McpCapabilities: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult>;

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<McpPromptResult>;

    async fn list_resources(&self) -> Result<Vec<McpResource>>;

    async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContents>>;
}

#[async_trait]
impl McpCapabilities for McpConnection {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        McpConnection::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult> {
        McpConnection::call_tool(self, name, arguments).await
    }

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        McpConnection::list_prompts(self).await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<McpPromptResult> {
        McpConnection::get_prompt(self, name, arguments).await
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        McpConnection::list_resources(self).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContents>> {
        McpConnection::read_resource(self, uri).await
    }
}
