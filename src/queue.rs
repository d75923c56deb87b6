//! Per-session command queue: FIFO serialization of debugger commands onto
//! one child process, with adaptive per-command deadlines and lifecycle
//! notifications.
//!
//! `enqueue` is wait-free for the caller: it mints an ID, publishes a Queued
//! record, and hands the command to a dedicated worker task. The worker is
//! the only component that talks to the driver and the only writer of
//! Executing/terminal transitions. Commands execute strictly in enqueue
//! order, one at a time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::driver::{ChildDriver, ExitReason};
use crate::error::{EngineError, Result};
use crate::ids;
use crate::notify::{CommandStatusEvent, Notification, NotificationBus};
use crate::parser;
use crate::recovery::RecoverySupervisor;
use crate::session::{SessionContext, SessionStatus};

/// How long `dispose` waits for the worker to drain and exit.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on output text carried inside notifications (full output stays on
/// the record).
const NOTIFY_OUTPUT_CAP: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Cancelled
        )
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::Executing => "executing",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The full description of one command's trip through the queue. Immutable
/// once finalized and handed to the result cache.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub session_id: String,
    pub command: String,
    pub state: CommandState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    /// The effective deadline chosen for this command.
    pub timeout: Duration,
}

/// Timeout category for a command, chosen from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    Simple,
    Default,
    Complex,
}

/// Known-slow operations: crash analysis and symbol (re)loading can take
/// orders of magnitude longer than anything else.
const COMPLEX_PREFIXES: &[&str] = &["!analyze", ".reload", ".symfix", ".sympath", "ld"];

/// Known-fast operations: stack walks, register dumps, module lists and
/// other short informational commands.
const SIMPLE_COMMANDS: &[&str] = &[
    "k", "kb", "kc", "kp", "kv", "kn", "r", "lm", "lml", "lmv", "version", ".time", ".echo",
];

/// Categorize a command by its first token.
#[must_use]
pub fn categorize(command: &str) -> CommandCategory {
    let Some(token) = command.split_whitespace().next() else {
        return CommandCategory::Default;
    };
    let token = token.to_lowercase();
    if COMPLEX_PREFIXES.iter().any(|p| token == *p) {
        return CommandCategory::Complex;
    }
    if SIMPLE_COMMANDS.iter().any(|s| token == *s) {
        return CommandCategory::Simple;
    }
    CommandCategory::Default
}

/// The deadline for a command, from its category and the configured tiers.
#[must_use]
pub fn timeout_for(command: &str, config: &EngineConfig) -> Duration {
    match categorize(command) {
        CommandCategory::Simple => config.short_command_timeout,
        CommandCategory::Complex => config.long_command_timeout,
        CommandCategory::Default => config.default_command_timeout,
    }
}

/// One live (not yet finalized) command: the mutable record plus its cancel
/// token and completion signal.
pub struct CommandSlot {
    pub id: String,
    pub command: String,
    record: std::sync::RwLock<CommandRecord>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    timed_out: AtomicBool,
    /// Extra deadline milliseconds granted while executing; consumed by the
    /// deadline watcher when the current budget runs out.
    extension_ms: AtomicU64,
}

impl CommandSlot {
    fn new(record: CommandRecord) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            id: record.command_id.clone(),
            command: record.command.clone(),
            record: std::sync::RwLock::new(record),
            done_tx,
            done_rx,
            cancel: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            extension_ms: AtomicU64::new(0),
        })
    }

    /// Point-in-time copy of the record.
    #[must_use]
    pub fn snapshot(&self) -> CommandRecord {
        self.record.read().expect("command record lock poisoned").clone()
    }

    /// Receiver that flips to `true` exactly once, at finalization.
    #[must_use]
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }
}

/// Per-session FIFO command queue with a single worker task.
pub struct CommandQueue {
    session: Arc<SessionContext>,
    config: Arc<EngineConfig>,
    driver: Arc<dyn ChildDriver>,
    cache: Arc<ResultCache>,
    bus: Arc<NotificationBus>,
    recovery: Arc<RecoverySupervisor>,
    live: DashMap<String, Arc<CommandSlot>>,
    tx: mpsc::UnboundedSender<Arc<CommandSlot>>,
    worker_ready_rx: watch::Receiver<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue").finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Build the queue and spawn its worker. The worker will not dequeue
    /// anything until `ready_rx` turns true (the session handshake
    /// finished); enqueue is legal before that.
    pub fn spawn(
        session: Arc<SessionContext>,
        config: Arc<EngineConfig>,
        driver: Arc<dyn ChildDriver>,
        cache: Arc<ResultCache>,
        bus: Arc<NotificationBus>,
        recovery: Arc<RecoverySupervisor>,
        ready_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (worker_ready_tx, worker_ready_rx) = watch::channel(false);
        let shutdown = session.shutdown.child_token();

        let queue = Arc::new(Self {
            session,
            config,
            driver,
            cache,
            bus,
            recovery,
            live: DashMap::new(),
            tx,
            worker_ready_rx,
            worker: std::sync::Mutex::new(None),
            shutdown,
        });

        let handle = tokio::spawn(Self::worker_loop(
            queue.clone(),
            rx,
            ready_rx,
            worker_ready_tx,
        ));
        *queue.worker.lock().expect("worker handle lock poisoned") = Some(handle);
        queue
    }

    /// Enqueue a command. Wait-free: assigns an ID, publishes the Queued
    /// record, and returns; execution happens on the worker.
    pub fn enqueue(&self, command: &str) -> Result<String> {
        ids::validate_command_text(command)?;
        let status = self.session.status();
        if !matches!(status, SessionStatus::Initializing | SessionStatus::Active) {
            return Err(EngineError::SessionNotActive {
                session_id: self.session.session_id.clone(),
                status,
            });
        }

        let command_id = ids::mint_command_id();
        let record = CommandRecord {
            command_id: command_id.clone(),
            session_id: self.session.session_id.clone(),
            command: command.trim().to_string(),
            state: CommandState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            cancel_reason: None,
            timeout: timeout_for(command, &self.config),
        };
        let slot = CommandSlot::new(record);
        self.live.insert(command_id.clone(), slot.clone());

        self.publish_status(&slot, None, Some("command queued".into()));

        if self.tx.send(slot.clone()).is_err() {
            // Worker already gone; the session is tearing down.
            self.finalize(
                &slot,
                CommandState::Cancelled,
                None,
                None,
                Some("session closing".into()),
            );
            return Err(EngineError::SessionNotActive {
                session_id: self.session.session_id.clone(),
                status: self.session.status(),
            });
        }

        self.session.touch();
        tracing::debug!(
            session = %self.session.session_id,
            command_id = %command_id,
            command = %parser::format_for_logging(command, 200),
            "command enqueued"
        );
        Ok(command_id)
    }

    /// Record for one command, live or cached.
    #[must_use]
    pub fn get_info(&self, command_id: &str) -> Option<CommandRecord> {
        if let Some(slot) = self.live.get(command_id) {
            return Some(slot.snapshot());
        }
        self.cache.get(command_id).map(|r| (*r).clone())
    }

    /// All records for the session, oldest first.
    #[must_use]
    pub fn get_all_infos(&self) -> Vec<CommandRecord> {
        let mut records: Vec<CommandRecord> =
            self.cache.all().iter().map(|r| (**r).clone()).collect();
        for entry in self.live.iter() {
            records.push(entry.value().snapshot());
        }
        records.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        records
    }

    /// Live slot lookup for cooperative waits.
    #[must_use]
    pub fn find_slot(&self, command_id: &str) -> Option<Arc<CommandSlot>> {
        self.live.get(command_id).map(|s| s.value().clone())
    }

    /// Cancel one command. Pre-execution: the worker will skip it. In
    /// flight: interrupts the debugger; the record turns Cancelled when the
    /// worker observes the cancel exit. Terminal records return false.
    pub fn cancel(&self, command_id: &str, reason: &str) -> bool {
        let Some(slot) = self.live.get(command_id).map(|s| s.value().clone()) else {
            return false;
        };

        let executing = {
            let mut record = slot.record.write().expect("command record lock poisoned");
            if record.state.is_terminal() {
                return false;
            }
            record.cancel_reason = Some(reason.to_string());
            record.state == CommandState::Executing
        };

        slot.cancel.cancel();
        if executing {
            let driver = self.driver.clone();
            tokio::spawn(async move { driver.cancel_current().await });
        }
        self.session.touch();
        true
    }

    /// Cancel everything pending or in flight. Returns how many commands
    /// were signalled. Never blocks on an empty queue.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let slots: Vec<Arc<CommandSlot>> =
            self.live.iter().map(|e| e.value().clone()).collect();
        let mut cancelled = 0;
        let mut interrupt = false;
        for slot in slots {
            let mut record = slot.record.write().expect("command record lock poisoned");
            if record.state.is_terminal() {
                continue;
            }
            if record.cancel_reason.is_none() {
                record.cancel_reason = Some(reason.to_string());
            }
            interrupt |= record.state == CommandState::Executing;
            drop(record);
            slot.cancel.cancel();
            cancelled += 1;
        }
        if interrupt {
            let driver = self.driver.clone();
            tokio::spawn(async move { driver.cancel_current().await });
        }
        cancelled
    }

    /// Grant a command more deadline. The extra budget is added to whatever
    /// remains; a deadline that already fired is never resurrected.
    pub fn extend_timeout(&self, command_id: &str, delta: Duration) -> bool {
        let Some(slot) = self.live.get(command_id).map(|s| s.value().clone()) else {
            return false;
        };
        if slot.timed_out.load(Ordering::Acquire) {
            return false;
        }
        if slot.snapshot().state.is_terminal() {
            return false;
        }
        slot.extension_ms
            .fetch_add(delta.as_millis() as u64, Ordering::AcqRel);
        true
    }

    /// True once the worker has observed the session handshake and is
    /// dequeueing.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.worker_ready_rx.borrow()
    }

    /// Wait up to `budget` for the worker to come up.
    pub async fn wait_ready(&self, budget: Duration) -> bool {
        let mut rx = self.worker_ready_rx.clone();
        if *rx.borrow() {
            return true;
        }
        matches!(timeout(budget, rx.wait_for(|ready| *ready)).await, Ok(Ok(_)))
    }

    /// Number of commands not yet finalized.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Signal shutdown and wait for the worker to drain. Safe to call twice.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let handle = self
            .worker
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = timeout(DISPOSE_TIMEOUT, handle).await;
        }
    }

    // -- worker ------------------------------------------------------------

    async fn worker_loop(
        queue: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Arc<CommandSlot>>,
        mut ready_rx: watch::Receiver<bool>,
        worker_ready_tx: watch::Sender<bool>,
    ) {
        // Hold all dequeueing until the session handshake finishes.
        loop {
            if *ready_rx.borrow() {
                break;
            }
            tokio::select! {
                () = queue.shutdown.cancelled() => {
                    Self::drain(&queue, &mut rx);
                    return;
                }
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        Self::drain(&queue, &mut rx);
                        return;
                    }
                }
            }
        }
        let _ = worker_ready_tx.send(true);

        loop {
            tokio::select! {
                () = queue.shutdown.cancelled() => break,
                slot = rx.recv() => match slot {
                    None => break,
                    Some(slot) => queue.run_one(slot).await,
                }
            }
        }

        Self::drain(&queue, &mut rx);
    }

    /// Finalize everything still queued as Cancelled ("session closing").
    fn drain(queue: &Arc<Self>, rx: &mut mpsc::UnboundedReceiver<Arc<CommandSlot>>) {
        rx.close();
        while let Ok(slot) = rx.try_recv() {
            queue.finalize(
                &slot,
                CommandState::Cancelled,
                None,
                None,
                Some("session closing".into()),
            );
        }
    }

    async fn run_one(self: &Arc<Self>, slot: Arc<CommandSlot>) {
        if self.shutdown.is_cancelled() {
            self.finalize(
                &slot,
                CommandState::Cancelled,
                None,
                None,
                Some("session closing".into()),
            );
            return;
        }
        if slot.cancel.is_cancelled() {
            let reason = slot
                .snapshot()
                .cancel_reason
                .unwrap_or_else(|| "cancelled before execution".into());
            self.finalize(&slot, CommandState::Cancelled, None, None, Some(reason));
            return;
        }

        if !self.recovery.is_session_healthy().await
            && !self.recovery.recover("pre-command health check failed").await
        {
            self.finalize(
                &slot,
                CommandState::Failed,
                None,
                Some("session unhealthy".into()),
                None,
            );
            return;
        }

        let budget = {
            let mut record = slot.record.write().expect("command record lock poisoned");
            if record.state.is_terminal() {
                return;
            }
            record.state = CommandState::Executing;
            let now = Utc::now();
            record.started_at = Some(now.max(record.queued_at));
            record.timeout
        };
        self.publish_status(&slot, Some(10), Some("command executing".into()));
        self.session.touch();

        let exec_token = CancellationToken::new();
        let watcher_done = CancellationToken::new();
        let watcher = tokio::spawn(Self::deadline_watcher(
            slot.clone(),
            self.shutdown.clone(),
            exec_token.clone(),
            watcher_done.clone(),
            budget,
            self.recovery.clone(),
        ));

        let outcome = self.driver.execute(&slot.command, &exec_token).await;

        watcher_done.cancel();
        let _ = watcher.await;

        match outcome {
            Ok(out) => match out.reason {
                ExitReason::Prompt => {
                    self.finalize(&slot, CommandState::Completed, Some(out.text), None, None);
                }
                ExitReason::Timeout => {
                    self.request_recovery(format!("command produced no prompt {}", slot.id));
                    self.finalize(
                        &slot,
                        CommandState::Failed,
                        Some(out.text),
                        Some("no debugger prompt within the read timeout".into()),
                        None,
                    );
                }
                ExitReason::Cancelled => {
                    if slot.timed_out.load(Ordering::Acquire) {
                        // The deadline watcher already requested recovery.
                        self.finalize(
                            &slot,
                            CommandState::Failed,
                            Some(out.text),
                            Some(format!(
                                "command timed out after {}s",
                                budget.as_secs()
                            )),
                            None,
                        );
                    } else {
                        let reason = slot
                            .snapshot()
                            .cancel_reason
                            .unwrap_or_else(|| {
                                if self.shutdown.is_cancelled() {
                                    "session closing".into()
                                } else {
                                    "cancelled".into()
                                }
                            });
                        self.finalize(
                            &slot,
                            CommandState::Cancelled,
                            Some(out.text),
                            None,
                            Some(reason),
                        );
                    }
                }
                ExitReason::ChildExited => {
                    self.request_recovery("command execution failed".into());
                    self.finalize(
                        &slot,
                        CommandState::Failed,
                        Some(out.text),
                        Some("debugger exited during command".into()),
                        None,
                    );
                }
            },
            Err(e) => {
                self.request_recovery("command execution failed".into());
                self.finalize(
                    &slot,
                    CommandState::Failed,
                    None,
                    Some(e.to_string()),
                    None,
                );
            }
        }
        self.session.touch();
    }

    async fn deadline_watcher(
        slot: Arc<CommandSlot>,
        shutdown: CancellationToken,
        exec_token: CancellationToken,
        done: CancellationToken,
        budget: Duration,
        recovery: Arc<RecoverySupervisor>,
    ) {
        let mut remaining = budget;
        loop {
            tokio::select! {
                () = done.cancelled() => return,
                () = slot.cancel.cancelled() => {
                    exec_token.cancel();
                    return;
                }
                () = shutdown.cancelled() => {
                    exec_token.cancel();
                    return;
                }
                () = tokio::time::sleep(remaining) => {
                    // Consume any extension granted meanwhile before firing.
                    let extra = slot.extension_ms.swap(0, Ordering::AcqRel);
                    if extra > 0 {
                        remaining = Duration::from_millis(extra);
                        continue;
                    }
                    slot.timed_out.store(true, Ordering::Release);
                    exec_token.cancel();
                    let reason = format!("command timeout {}", slot.id);
                    tokio::spawn(async move {
                        let _ = recovery.recover(&reason).await;
                    });
                    return;
                }
            }
        }
    }

    fn request_recovery(&self, reason: String) {
        let recovery = self.recovery.clone();
        tokio::spawn(async move {
            let _ = recovery.recover(&reason).await;
        });
    }

    /// Finalize a record exactly once: terminal state, completion timestamp,
    /// cache hand-off, done signal, terminal notification.
    fn finalize(
        &self,
        slot: &Arc<CommandSlot>,
        state: CommandState,
        output: Option<String>,
        error: Option<String>,
        cancel_reason: Option<String>,
    ) {
        debug_assert!(state.is_terminal());
        let record = {
            let mut record = slot.record.write().expect("command record lock poisoned");
            if record.state.is_terminal() {
                return;
            }
            record.state = state;
            let now = Utc::now();
            let floor = record.started_at.unwrap_or(record.queued_at);
            record.completed_at = Some(now.max(floor));
            record.output = output;
            record.error = error;
            if cancel_reason.is_some() {
                record.cancel_reason = cancel_reason;
            }
            record.clone()
        };

        self.cache.put(Arc::new(record));
        self.live.remove(&slot.id);
        let _ = slot.done_tx.send(true);
        self.publish_status(slot, None, None);

        tracing::debug!(
            session = %self.session.session_id,
            command_id = %slot.id,
            state = %state,
            "command finalized"
        );
    }

    fn publish_status(&self, slot: &Arc<CommandSlot>, progress: Option<u8>, message: Option<String>) {
        let record = match slot.record.read() {
            Ok(r) => r.clone(),
            Err(_) => return,
        };
        let output = record
            .output
            .as_deref()
            .map(|o| parser::format_for_logging(o, NOTIFY_OUTPUT_CAP));
        let message = message.or_else(|| record.cancel_reason.clone());
        self.bus.publish(Notification::CommandStatus(CommandStatusEvent {
            session_id: record.session_id.clone(),
            command_id: record.command_id.clone(),
            command: record.command.clone(),
            status: record.state,
            progress,
            message,
            output,
            error: record.error.clone(),
            timestamp: Utc::now(),
        }));
    }
}
