//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a
//! test client to the crashdbg server, and exercises the session tools
//! through the MCP protocol against a scripted fake debugger.

mod common;

use std::sync::Arc;

use common::{Behavior, FakeDriverFactory, temp_dump, test_config};
use crashdbg::engine::DebugEngine;
use crashdbg::server::CrashDbgServer;
use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;

/// Minimal test client that implements ClientHandler with defaults.
#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

/// Helper: start a server+client pair connected via duplex transport.
async fn setup(
    engine: DebugEngine,
) -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let server = CrashDbgServer::with_engine(engine);
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient;
    client.serve(client_transport).await.unwrap()
}

fn engine_with_fakes() -> (DebugEngine, Arc<FakeDriverFactory>) {
    let dir = std::env::temp_dir().join("crashdbg-server-tests");
    let factory = FakeDriverFactory::new();
    let engine = DebugEngine::with_factory(test_config(&dir), factory.clone());
    (engine, factory)
}

/// Helper: call a tool and return the raw result.
async fn call_tool_raw(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> CallToolResult {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };
    result
}

/// Helper: call a tool and parse the JSON text content from the response.
async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let result = call_tool_raw(client, name, args).await;
    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

// ---------------------------------------------------------------------------
// Session lifecycle through the protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_run_read_close_roundtrip() {
    let (engine, factory) = engine_with_fakes();
    let client = setup(engine).await;
    let (_dump_dir, dump) = temp_dump();

    let opened = call_tool(
        &client,
        "open_session",
        serde_json::json!({"dump_path": dump}),
    )
    .await;
    let session_id = opened["session_id"].as_str().unwrap().to_string();
    assert_eq!(opened["status"], "active");

    factory
        .last()
        .script("version", Behavior::respond("Microsoft (R) Debugger 10.0"));

    let queued = call_tool(
        &client,
        "run_command",
        serde_json::json!({"session_id": session_id, "command": "version"}),
    )
    .await;
    let command_id = queued["command_id"].as_str().unwrap().to_string();
    assert_eq!(queued["status"], "queued");

    let result = call_tool(
        &client,
        "read_result",
        serde_json::json!({
            "session_id": session_id,
            "command_id": command_id,
            "max_wait_seconds": 5
        }),
    )
    .await;
    assert_eq!(result["state"], "completed");
    assert!(
        result["output"].as_str().unwrap().contains("Debugger 10.0"),
        "unexpected output: {result}"
    );

    let closed = call_tool(
        &client,
        "close_session",
        serde_json::json!({"session_id": session_id}),
    )
    .await;
    assert_eq!(closed["closed"], true);

    let closed_again = call_tool(
        &client,
        "close_session",
        serde_json::json!({"session_id": session_id}),
    )
    .await;
    assert_eq!(closed_again["closed"], false);
}

#[tokio::test]
async fn test_list_sessions_and_commands() {
    let (engine, _factory) = engine_with_fakes();
    let client = setup(engine).await;
    let (_dump_dir, dump) = temp_dump();

    let opened = call_tool(
        &client,
        "open_session",
        serde_json::json!({"dump_path": dump}),
    )
    .await;
    let session_id = opened["session_id"].as_str().unwrap().to_string();

    let listed = call_tool(&client, "list_sessions", serde_json::json!({})).await;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(listed["stats"]["open_sessions"], 1);

    let queued = call_tool(
        &client,
        "run_command",
        serde_json::json!({"session_id": session_id, "command": "k"}),
    )
    .await;
    let command_id = queued["command_id"].as_str().unwrap().to_string();

    call_tool(
        &client,
        "read_result",
        serde_json::json!({
            "session_id": session_id,
            "command_id": command_id,
            "max_wait_seconds": 5
        }),
    )
    .await;

    let commands = call_tool(
        &client,
        "list_session_commands",
        serde_json::json!({"session_id": session_id}),
    )
    .await;
    let records = commands.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["command"], "k");
    assert_eq!(records[0]["state"], "completed");
}

#[tokio::test]
async fn test_cancel_finished_command_reports_false() {
    let (engine, _factory) = engine_with_fakes();
    let client = setup(engine).await;
    let (_dump_dir, dump) = temp_dump();

    let opened = call_tool(
        &client,
        "open_session",
        serde_json::json!({"dump_path": dump}),
    )
    .await;
    let session_id = opened["session_id"].as_str().unwrap().to_string();

    let queued = call_tool(
        &client,
        "run_command",
        serde_json::json!({"session_id": session_id, "command": "lm"}),
    )
    .await;
    let command_id = queued["command_id"].as_str().unwrap().to_string();

    call_tool(
        &client,
        "read_result",
        serde_json::json!({
            "session_id": session_id,
            "command_id": command_id,
            "max_wait_seconds": 5
        }),
    )
    .await;

    let cancelled = call_tool(
        &client,
        "cancel_command",
        serde_json::json!({"session_id": session_id, "command_id": command_id}),
    )
    .await;
    assert_eq!(cancelled["cancelled"], false);
}

// ---------------------------------------------------------------------------
// Error surfaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_session_with_missing_dump_is_error() {
    let (engine, _factory) = engine_with_fakes();
    let client = setup(engine).await;

    let result = call_tool_raw(
        &client,
        "open_session",
        serde_json::json!({"dump_path": "/no/such/crash.dmp"}),
    )
    .await;
    assert_eq!(result.is_error, Some(true));
}

#[tokio::test]
async fn test_run_command_on_unknown_session_is_error() {
    let (engine, _factory) = engine_with_fakes();
    let client = setup(engine).await;

    let result = call_tool_raw(
        &client,
        "run_command",
        serde_json::json!({
            "session_id": "sess-000000-unknown0-00000000-0000",
            "command": "k"
        }),
    )
    .await;
    assert_eq!(result.is_error, Some(true));
}
