//! The public engine façade: everything a transport needs to create
//! sessions, enqueue commands, cancel, and read results with a cooperative
//! wait.
//!
//! `read_command_result` never busy-polls and never blocks past its budget:
//! it waits on the per-command completion signal the queue worker sets at
//! finalization, and on budget expiry returns the current snapshot annotated
//! with a note.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::driver::DriverFactory;
use crate::error::{EngineError, Result};
use crate::ids;
use crate::notify::NotificationBus;
use crate::queue::{CommandRecord, CommandState};
use crate::session::{ManagerStats, SessionInfo, SessionManager};

/// Output cap applied to records returned from listings. Full output stays
/// on the record and is returned by `read_command_result`.
const LIST_OUTPUT_CAP: usize = 500;

/// Wire-facing view of one command record.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecordView {
    pub session_id: String,
    pub command_id: String,
    pub command: String,
    pub state: CommandState,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn view_of(record: &CommandRecord, note: Option<String>, output_cap: Option<usize>) -> CommandRecordView {
    let output = match (&record.output, output_cap) {
        (Some(output), Some(cap)) => Some(window_output(output, cap)),
        (output, _) => output.clone(),
    };
    CommandRecordView {
        session_id: record.session_id.clone(),
        command_id: record.command_id.clone(),
        command: record.command.clone(),
        state: record.state,
        queued_at: record.queued_at,
        started_at: record.started_at,
        completed_at: record.completed_at,
        output,
        error: record.error.clone(),
        cancel_reason: record.cancel_reason.clone(),
        timeout_secs: record.timeout.as_secs(),
        note,
    }
}

/// Head + tail window over large output, with a total-length marker in the
/// middle.
fn window_output(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }
    let half = max_len / 2;
    let mut head_end = half.min(output.len());
    while head_end > 0 && !output.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = output.len().saturating_sub(half);
    while tail_start < output.len() && !output.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [{} chars total] ...\n{}",
        &output[..head_end],
        output.len(),
        &output[tail_start..]
    )
}

/// Process-wide engine: the session manager plus the notification bus,
/// cheap to clone and hand to a transport.
#[derive(Clone)]
pub struct DebugEngine {
    config: Arc<EngineConfig>,
    bus: Arc<NotificationBus>,
    manager: Arc<SessionManager>,
}

impl DebugEngine {
    /// Production engine driving real debugger children.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let bus = Arc::new(NotificationBus::new());
        let manager = SessionManager::new(config.clone(), bus.clone());
        Self {
            config,
            bus,
            manager,
        }
    }

    /// Engine with an injected driver factory (fakes in tests).
    #[must_use]
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn DriverFactory>) -> Self {
        let config = Arc::new(config);
        let bus = Arc::new(NotificationBus::new());
        let manager = SessionManager::with_factory(config.clone(), bus.clone(), factory);
        Self {
            config,
            bus,
            manager,
        }
    }

    #[must_use]
    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    #[must_use]
    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    #[must_use]
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.clone()
    }

    pub async fn create_session(
        &self,
        dump_path: &str,
        symbols_path: Option<&str>,
    ) -> Result<String> {
        self.manager.create(dump_path, symbols_path).await
    }

    /// Close a session. Idempotent: `Ok(false)` when the ID is unknown.
    pub async fn close_session(&self, session_id: &str) -> Result<bool> {
        ids::validate_session_id(session_id)?;
        Ok(self.manager.close(session_id).await)
    }

    #[must_use]
    pub fn session_exists(&self, session_id: &str) -> bool {
        self.manager.exists(session_id)
    }

    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.manager.list_all()
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }

    /// Enqueue a command; returns immediately with the command ID.
    pub fn enqueue_command(&self, session_id: &str, command: &str) -> Result<String> {
        let session = self.manager.get_session(session_id)?;
        session.queue.enqueue(command)
    }

    /// All records for a session, oldest first, with windowed output.
    pub fn list_commands(&self, session_id: &str) -> Result<Vec<CommandRecordView>> {
        let session = self.manager.get_session(session_id)?;
        session.ctx.touch();
        Ok(session
            .queue
            .get_all_infos()
            .iter()
            .map(|record| view_of(record, None, Some(LIST_OUTPUT_CAP)))
            .collect())
    }

    /// Cancel one command. `Ok(false)` when the record is already terminal.
    pub fn cancel_command(&self, session_id: &str, command_id: &str) -> Result<bool> {
        ids::validate_command_id(command_id)?;
        let session = self.manager.get_session(session_id)?;
        session.ctx.touch();
        Ok(session.queue.cancel(command_id, "cancelled by client"))
    }

    /// Return the finalized record, waiting cooperatively up to `max_wait`.
    /// On budget expiry the current snapshot comes back with a note.
    pub async fn read_command_result(
        &self,
        session_id: &str,
        command_id: &str,
        max_wait: Duration,
    ) -> Result<CommandRecordView> {
        ids::validate_command_id(command_id)?;
        let session = self.manager.get_session(session_id)?;
        session.ctx.touch();

        if let Some(record) = session.cache.get(command_id) {
            return Ok(view_of(&record, None, None));
        }

        let Some(slot) = session.queue.find_slot(command_id) else {
            // Finalization may have moved the record between the two lookups.
            if let Some(record) = session.cache.get(command_id) {
                return Ok(view_of(&record, None, None));
            }
            return Err(EngineError::CommandNotFound {
                session_id: session_id.to_string(),
                command_id: command_id.to_string(),
            });
        };

        if max_wait.is_zero() {
            let snapshot = slot.snapshot();
            let note = (!snapshot.state.is_terminal())
                .then(|| "not finished yet; requested without waiting".to_string());
            return Ok(view_of(&snapshot, note, None));
        }

        let mut done = slot.subscribe_done();
        let finished = matches!(timeout(max_wait, done.wait_for(|done| *done)).await, Ok(Ok(_)));
        let snapshot = slot.snapshot();
        if finished || snapshot.state.is_terminal() {
            return Ok(view_of(&snapshot, None, None));
        }
        Ok(view_of(
            &snapshot,
            Some(format!(
                "not finished yet; waited up to {} seconds",
                max_wait.as_secs()
            )),
            None,
        ))
    }

    /// Close every session and stop background tasks. Safe to call twice.
    pub async fn dispose(&self) {
        self.manager.dispose().await;
    }
}
