//! Session/command ID minting and input validation.
//!
//! Session IDs are sortable by creation order (monotonic counter first) and
//! unique across the process lifetime (random bytes + wall clock + pid).
//! Command IDs are plain UUIDs; uniqueness within the process is all the
//! queue needs.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EngineError, Result};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a session ID: `sess-<6-digit-counter>-<8-hex-random>-<8-hex-ms>-<4-hex-pid>`.
#[must_use]
pub fn mint_session_id() -> String {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let random = uuid::Uuid::new_v4();
    let random32 = u32::from_be_bytes(random.as_bytes()[..4].try_into().expect("4 bytes"));
    let millis = chrono::Utc::now().timestamp_millis() as u64 & 0xFFFF_FFFF;
    let pid = std::process::id() & 0xFFFF;
    format!("sess-{counter:06}-{random32:08x}-{millis:08x}-{pid:04x}")
}

/// Mint a command ID.
#[must_use]
pub fn mint_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reject null/empty/whitespace session IDs.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "session id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Reject null/empty/whitespace command IDs.
pub fn validate_command_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "command id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Reject empty command text.
pub fn validate_command_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "command text must not be empty".into(),
        ));
    }
    Ok(())
}

/// Reject empty or nonexistent dump paths.
pub fn validate_dump_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "dump path must not be empty".into(),
        ));
    }
    if !Path::new(path).exists() {
        return Err(EngineError::InvalidInput(format!(
            "dump path does not exist: {path}"
        )));
    }
    Ok(())
}

/// Reject a supplied-but-absent symbol path. `None` is fine.
pub fn validate_symbols_path(path: Option<&str>) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    if path.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "symbols path must not be empty when supplied".into(),
        ));
    }
    if !Path::new(path).exists() {
        return Err(EngineError::InvalidInput(format!(
            "symbols path does not exist: {path}"
        )));
    }
    Ok(())
}
