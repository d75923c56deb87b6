//! Notification bus: fan-out of command-status, session-lifecycle, and
//! recovery events to registered subscribers.
//!
//! Two delivery flavors: synchronous handlers (errors are logged and
//! swallowed so one failing handler never starves the rest) and queued
//! channel subscribers (a dropped receiver is skipped). Notifications for a
//! single command are published in order queued → executing → terminal;
//! there is no cross-command ordering guarantee.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;
use tokio::sync::mpsc;

use crate::queue::CommandState;
use crate::session::SessionStatus;

/// Status change of one queued command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandStatusEvent {
    pub session_id: String,
    pub command_id: String,
    pub command: String,
    pub status: CommandState,
    /// Coarse progress, 0–100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Closed,
    Expired,
}

/// Session lifecycle change.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: SessionEventKind,
    pub description: String,
    pub dump_path: String,
    pub status: SessionStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Started,
    CancelInPlace,
    Restart,
    Faulted,
}

/// Progress of one recovery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    pub session_id: String,
    pub step: RecoveryStep,
    pub success: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    CommandStatus(CommandStatusEvent),
    Session(SessionEvent),
    Recovery(RecoveryEvent),
}

impl Notification {
    /// Session the notification belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Notification::CommandStatus(e) => &e.session_id,
            Notification::Session(e) => &e.session_id,
            Notification::Recovery(e) => &e.session_id,
        }
    }
}

type SyncHandler = Box<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

/// Fan-out publisher with isolated subscriber failure.
pub struct NotificationBus {
    handlers: RwLock<Vec<(String, SyncHandler)>>,
    channels: RwLock<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Register a synchronous handler. A handler error is logged against its
    /// name and swallowed.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .expect("notification handler lock poisoned")
            .push((name.into(), Box::new(handler)));
    }

    /// Subscribe with queued delivery. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .write()
            .expect("notification channel lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver a notification to every subscriber independently.
    pub fn publish(&self, notification: Notification) {
        {
            let handlers = self
                .handlers
                .read()
                .expect("notification handler lock poisoned");
            for (name, handler) in handlers.iter() {
                if let Err(e) = handler(&notification) {
                    tracing::warn!(subscriber = %name, error = %e, "notification handler failed");
                }
            }
        }

        let mut channels = self
            .channels
            .write()
            .expect("notification channel lock poisoned");
        channels.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers (both flavors).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let handlers = self
            .handlers
            .read()
            .expect("notification handler lock poisoned")
            .len();
        let channels = self
            .channels
            .read()
            .expect("notification channel lock poisoned")
            .len();
        handlers + channels
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
