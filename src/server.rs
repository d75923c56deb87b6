//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `CrashDbgServer` with tools for the session engine:
//! `open_session`, `close_session`, `list_sessions`, `run_command`,
//! `read_result`, `cancel_command`, `list_session_commands`. The transport
//! does no engine logic; it deserializes parameters, calls the façade, and
//! serializes structured JSON back.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::DebugEngine;
use crate::session::{ManagerStats, SessionInfo};

/// Default wait applied by `read_result` when the caller gives none.
const DEFAULT_READ_WAIT_SECONDS: u64 = 30;

/// Ceiling on a single `read_result` wait. Poll again for longer commands.
const MAX_READ_WAIT_SECONDS: u64 = 300;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `open_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct OpenSessionParams {
    /// Path to the crash dump file to analyze.
    pub dump_path: String,
    /// Optional symbol search path for this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols_path: Option<String>,
}

/// Parameters for the `close_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CloseSessionParams {
    /// ID of the session to close.
    pub session_id: String,
}

/// Parameters for the `run_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunCommandParams {
    /// ID of the session to run in.
    pub session_id: String,
    /// The debugger command to enqueue (e.g. `!analyze -v`, `k`, `lm`).
    pub command: String,
}

/// Parameters for the `read_result` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ReadResultParams {
    /// ID of the session that owns the command.
    pub session_id: String,
    /// ID returned by `run_command`.
    pub command_id: String,
    /// How long to wait for completion, in seconds. 0 returns the current
    /// snapshot immediately. Defaults to 30, capped at 300.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_seconds: Option<u64>,
}

/// Parameters for the `cancel_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CancelCommandParams {
    /// ID of the session that owns the command.
    pub session_id: String,
    /// ID of the command to cancel.
    pub command_id: String,
}

/// Parameters for the `list_session_commands` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListSessionCommandsParams {
    /// ID of the session to list.
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Result structs (serialized to JSON and returned as tool content)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct OpenSessionResult {
    session_id: String,
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CloseSessionResult {
    session_id: String,
    closed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RunCommandResult {
    session_id: String,
    command_id: String,
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CancelCommandResult {
    session_id: String,
    command_id: String,
    cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ListSessionsResult {
    sessions: Vec<SessionInfo>,
    stats: ManagerStats,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The crashdbg MCP server: a thin tool surface over [`DebugEngine`].
#[derive(Clone)]
pub struct CrashDbgServer {
    engine: DebugEngine,
    tool_router: ToolRouter<CrashDbgServer>,
}

impl CrashDbgServer {
    /// Create a server with a production engine.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_engine(DebugEngine::new(config))
    }

    /// Create a server around an existing engine (tests wire fakes here).
    #[must_use]
    pub fn with_engine(engine: DebugEngine) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &DebugEngine {
        &self.engine
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

#[tool_router]
impl CrashDbgServer {
    #[tool(
        description = "Open a crash-dump analysis session: launches a debugger against the dump file and waits for it to become ready. Returns a session_id used by all other tools. Sessions are closed automatically after being idle too long; close them explicitly with close_session when done."
    )]
    async fn open_session(
        &self,
        Parameters(params): Parameters<OpenSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(dump = %params.dump_path, "open_session");
        match self
            .engine
            .create_session(&params.dump_path, params.symbols_path.as_deref())
            .await
        {
            Ok(session_id) => json_content(&OpenSessionResult {
                session_id,
                status: "active",
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Close a session and terminate its debugger process. Pending commands are cancelled. Returns closed=false if the session is already gone."
    )]
    async fn close_session(
        &self,
        Parameters(params): Parameters<CloseSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, "close_session");
        match self.engine.close_session(&params.session_id).await {
            Ok(closed) => json_content(&CloseSessionResult {
                session_id: params.session_id,
                closed,
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "List all open sessions with status, dump path, pending command count, and engine totals."
    )]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        json_content(&ListSessionsResult {
            sessions: self.engine.list_sessions(),
            stats: self.engine.stats(),
        })
    }

    #[tool(
        description = "Enqueue a debugger command in a session and return immediately with a command_id. Commands run strictly in enqueue order, one at a time per session. Use read_result to block for the output. Slow commands like `!analyze -v` get a long per-command timeout automatically."
    )]
    async fn run_command(
        &self,
        Parameters(params): Parameters<RunCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, command = %params.command, "run_command");
        match self
            .engine
            .enqueue_command(&params.session_id, &params.command)
        {
            Ok(command_id) => json_content(&RunCommandResult {
                session_id: params.session_id,
                command_id,
                status: "queued",
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Read a command's result, blocking up to max_wait_seconds for it to finish. If the command is still running when the budget expires, returns the current snapshot with a note -- call again to keep waiting. max_wait_seconds=0 returns the snapshot immediately."
    )]
    async fn read_result(
        &self,
        Parameters(params): Parameters<ReadResultParams>,
    ) -> Result<CallToolResult, McpError> {
        let wait = params
            .max_wait_seconds
            .unwrap_or(DEFAULT_READ_WAIT_SECONDS)
            .min(MAX_READ_WAIT_SECONDS);
        match self
            .engine
            .read_command_result(
                &params.session_id,
                &params.command_id,
                Duration::from_secs(wait),
            )
            .await
        {
            Ok(view) => json_content(&view),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Cancel a queued or executing command. Returns cancelled=false if the command already finished."
    )]
    async fn cancel_command(
        &self,
        Parameters(params): Parameters<CancelCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, command_id = %params.command_id, "cancel_command");
        match self
            .engine
            .cancel_command(&params.session_id, &params.command_id)
        {
            Ok(cancelled) => json_content(&CancelCommandResult {
                session_id: params.session_id,
                command_id: params.command_id,
                cancelled,
            }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "List all commands in a session (queued, executing, and finished) with state, timestamps, and windowed output. Use read_result for the full output of one command."
    )]
    async fn list_session_commands(
        &self,
        Parameters(params): Parameters<ListSessionCommandsParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.engine.list_commands(&params.session_id) {
            Ok(views) => json_content(&views),
            Err(e) => err_result(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for CrashDbgServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "crashdbg".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "crashdbg drives crash-dump debugger sessions for AI agents.\n\n\
                 WORKFLOW:\n\
                 1. open_session with a dump file path -> session_id\n\
                 2. run_command to enqueue debugger commands -> command_id (returns immediately)\n\
                 3. read_result to block for the output (set max_wait_seconds; call again if \
                 the command is still running)\n\
                 4. close_session when done\n\n\
                 Commands in one session run strictly in the order you enqueue them, one at a \
                 time. Enqueue several commands up front and read their results as they finish. \
                 Slow commands (`!analyze -v`, `.reload`) automatically get a long per-command \
                 timeout; quick ones (`k`, `r`, `lm`) a short one. If the debugger freezes, the \
                 engine cancels and restarts it; affected commands report failed and can be \
                 re-enqueued. Idle sessions are closed automatically."
                    .to_string(),
            ),
        }
    }
}
