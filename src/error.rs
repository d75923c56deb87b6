//! Engine error taxonomy.
//!
//! These are the failures surfaced synchronously to callers. Command-scoped
//! failures that happen during execution (timeout, child fault, cancellation)
//! are not errors here: they materialize as terminal states on the owning
//! command record and are reported by returning the record.

use crate::session::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session limit reached ({active}/{max}). Close some sessions first.")]
    SessionLimit { active: usize, max: usize },

    #[error("no session with id '{0}'")]
    SessionNotFound(String),

    #[error("no command '{command_id}' in session '{session_id}'")]
    CommandNotFound {
        session_id: String,
        command_id: String,
    },

    #[error("session '{session_id}' is not accepting commands (status: {status})")]
    SessionNotActive {
        session_id: String,
        status: SessionStatus,
    },

    #[error("debugger startup failed: {0}")]
    Startup(String),

    #[error("debugger fault: {0}")]
    ChildFault(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
