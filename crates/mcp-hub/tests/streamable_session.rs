//! Streamable HTTP sessions against a mock server

use mcp_hub::{ConnectionState, McpConnection, McpError, ServerDescriptor};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SESSION: &str = "sess-42";

fn request_id(req: &Request) -> Value {
    let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
    body["id"].clone()
}

async fn mount_handshake(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(|req: &Request| {
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", SESSION)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": request_id(req),
                    "result": {
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock-remote", "version": "0.3.0"}
                    }
                }))
        })
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

async fn mount_tools(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(|req: &Request| {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": request_id(req),
                "result": {
                    "tools": [{
                        "name": "search",
                        "description": "Search the web",
                        "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
                    }]
                }
            }))
        })
        .mount(server)
        .await;
}

fn descriptor(server: &MockServer) -> ServerDescriptor {
    ServerDescriptor::streamable("remote", format!("{}/mcp", server.uri())).with_timeout_ms(5_000)
}

#[tokio::test]
async fn test_lazy_handshake_on_first_listing() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;
    mount_tools(&server).await;

    let connection = McpConnection::new(descriptor(&server));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.connection_status().lazy_pending);

    let tools = connection.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(tools[0].parameters["properties"]["q"]["type"], "string");

    let status = connection.connection_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.server_name.as_deref(), Some("mock-remote"));
    assert_eq!(status.cached_tools, Some(1));
}

#[tokio::test]
async fn test_terminate_sends_delete_with_session() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;
    mount_tools(&server).await;

    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let connection = McpConnection::new(descriptor(&server));
    connection.list_tools().await.unwrap();
    connection.terminate_session().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_streamed_call_response() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;
    mount_tools(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(|req: &Request| {
            let message = json!({
                "jsonrpc": "2.0",
                "id": request_id(req),
                "result": {"content": [{"type": "text", "text": "3 results"}]}
            });
            ResponseTemplate::new(200).set_body_raw(
                format!("event: message\ndata: {}\n\n", message),
                "text/event-stream",
            )
        })
        .mount(&server)
        .await;

    let connection = McpConnection::new(descriptor(&server));
    let result = connection
        .call_tool("search", json!({"q": "rust"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "3 results");
    assert!(!result.is_error);
}

#[tokio::test]
async fn test_unauthorized_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).set_body_string("missing token"))
        .expect(1)
        .mount(&server)
        .await;

    let connection = McpConnection::new(descriptor(&server));
    assert!(matches!(
        connection.list_tools().await,
        Err(McpError::Unauthorized(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Failed);
}
