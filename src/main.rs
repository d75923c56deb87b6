//! Entry point for the crashdbg MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), creates the engine and server, and serves on stdin/stdout.

use anyhow::Result;
use crashdbg::config::EngineConfig;
use crashdbg::server::CrashDbgServer;
use rmcp::{ServiceExt, transport::stdio};
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting crashdbg MCP server v{}", env!("CARGO_PKG_VERSION"));

    let server = CrashDbgServer::new(EngineConfig::from_env());
    let engine = server.engine().clone();
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    engine.dispose().await;
    tracing::info!("crashdbg server shut down");
    Ok(())
}
