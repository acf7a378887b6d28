//! Stdio servers backed by real subprocesses

#![cfg(unix)]

use std::time::Duration;

use mcp_hub::{ConnectionState, McpConnection, McpError, ServerDescriptor, SpawnErrorKind};

/// A tiny MCP server in shell: answers initialize and tools/list, then
/// optionally exits.
fn scripted_server(name: &str, exit_after_list: bool) -> ServerDescriptor {
    let mut script = String::from(
        r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"0.1.0"}}}' ;;
    *'"method":"tools/list"'*)
      echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo input"}]}}'"#,
    );
    if exit_after_list {
        script.push_str("\n      exit 3");
    }
    script.push_str(" ;;\n  esac\ndone\n");
    ServerDescriptor::process(name, "sh", vec!["-c".to_string(), script]).with_timeout_ms(5_000)
}

#[tokio::test]
async fn test_missing_executable_fails_on_first_attempt() {
    let connection = McpConnection::new(ServerDescriptor::process(
        "ghost",
        "mcp-hub-definitely-not-installed",
        vec![],
    ));

    let started = std::time::Instant::now();
    match connection.connect().await {
        Err(McpError::SpawnFailed { server, kind, .. }) => {
            assert_eq!(server, "ghost");
            assert_eq!(kind, SpawnErrorKind::NotFound);
        }
        other => panic!("unexpected {:?}", other),
    }
    // No backoff sleep happened.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_handshake_and_listing_over_stdio() {
    let connection = McpConnection::new(scripted_server("scripted", false));
    connection.connect().await.unwrap();

    let status = connection.connection_status();
    assert!(status.healthy);
    assert!(status.pid.is_some());
    assert_eq!(status.server_name.as_deref(), Some("sh-server"));

    let tools = connection.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "echo");
    // No schema from the server means an empty object schema.
    assert_eq!(tools[0].parameters["type"], "object");

    connection.disconnect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_exited_process_is_unhealthy() {
    let connection = McpConnection::new(scripted_server("quitter", true));
    connection.connect().await.unwrap();
    connection.list_tools().await.unwrap();

    let mut status = connection.connection_status();
    for _ in 0..100 {
        if !status.healthy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = connection.connection_status();
    }
    assert!(!status.healthy);
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.last_error.is_some());
    assert!(connection.cached_tools().is_none());
}
