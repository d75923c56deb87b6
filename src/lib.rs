//! crashdbg: a multi-session debugger-automation engine with an MCP surface.
//!
//! The engine owns many concurrent crash-dump analysis sessions, each
//! driving one command-line debugger child process. Clients enqueue textual
//! debugger commands, read results with a cooperative bounded wait, cancel,
//! and close sessions. Per session, commands execute strictly in enqueue
//! order on a dedicated worker; a recovery supervisor cancels and restarts
//! frozen debuggers; an age-out sweeper reclaims idle sessions.

pub mod cache;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod ids;
pub mod notify;
pub mod parser;
pub mod queue;
pub mod recovery;
pub mod server;
pub mod session;
