//! Shared test fixtures: a scripted fake debugger driver and config/dump
//! helpers.
//!
//! The fake implements [`ChildDriver`] and is wired through the engine's
//! driver factory, so every layer above the driver runs the real code.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crashdbg::config::EngineConfig;
use crashdbg::driver::{ChildDriver, DriverFactory, DriverSpec, ExecOutput, ExitReason};
use crashdbg::error::{EngineError, Result};

/// The prompt a CDB-style debugger shows between commands.
pub const PROMPT: &str = "0:000>";

/// What the fake does when it receives a command.
#[derive(Clone)]
pub enum Behavior {
    /// Emit this output and then the prompt, after an optional delay.
    Respond { output: String, delay: Duration },
    /// Accept the command and never emit a prompt.
    Freeze,
    /// Report a driver-level read timeout with partial output.
    ReadTimeout { partial: String },
    /// Die mid-command.
    ExitChild,
}

impl Behavior {
    pub fn respond(output: &str) -> Self {
        Behavior::Respond {
            output: output.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn respond_after(output: &str, delay: Duration) -> Self {
        Behavior::Respond {
            output: output.to_string(),
            delay,
        }
    }
}

/// Scripted in-process debugger child.
pub struct FakeDriver {
    /// Idle read budget used by `Freeze` before reporting a read timeout.
    read_timeout: Duration,
    behaviors: Mutex<HashMap<String, Behavior>>,
    default_behavior: Mutex<Behavior>,
    /// While set, every command freezes regardless of script.
    frozen: AtomicBool,
    /// Whether a (re)start unwedges a frozen fake.
    unfreeze_on_start: AtomicBool,
    /// Remaining `start` calls to refuse.
    start_failures: AtomicU32,
    active: AtomicBool,
    executing: AtomicBool,
    attention: tokio::sync::Notify,
    pub executed: Mutex<Vec<String>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub attention_signals: AtomicU32,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        // The frozen fake only unblocks on cancel or attention; the queue's
        // per-command deadline always fires first in tests.
        Arc::new(Self {
            read_timeout: Duration::from_secs(60),
            behaviors: Mutex::new(HashMap::new()),
            default_behavior: Mutex::new(Behavior::respond("")),
            frozen: AtomicBool::new(false),
            unfreeze_on_start: AtomicBool::new(true),
            start_failures: AtomicU32::new(0),
            active: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            attention: tokio::sync::Notify::new(),
            executed: Mutex::new(Vec::new()),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            attention_signals: AtomicU32::new(0),
        })
    }

    /// Script the response for one exact command text.
    pub fn script(&self, command: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default_behavior.lock().unwrap() = behavior;
    }

    /// Freeze every subsequent command until the next (re)start.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Keep the fake frozen even across restarts.
    pub fn freeze_permanently(&self) {
        self.unfreeze_on_start.store(false, Ordering::Release);
        self.frozen.store(true, Ordering::Release);
    }

    /// Refuse the next `n` start calls.
    pub fn fail_next_starts(&self, n: u32) {
        self.start_failures.store(n, Ordering::Release);
    }

    /// Commands executed so far, excluding health probes.
    pub fn commands_executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.contains("crashdbg_health_probe"))
            .cloned()
            .collect()
    }

    async fn execute_inner(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput> {
        let behavior = if self.frozen.load(Ordering::Acquire) {
            Behavior::Freeze
        } else {
            self.behaviors
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or_else(|| self.default_behavior.lock().unwrap().clone())
        };

        match behavior {
            Behavior::Respond { output, delay } => {
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Ok(ExecOutput {
                                text: String::new(),
                                reason: ExitReason::Cancelled,
                            });
                        }
                        () = self.attention.notified() => {
                            return Ok(ExecOutput {
                                text: String::new(),
                                reason: ExitReason::Cancelled,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(ExecOutput {
                    text: output,
                    reason: ExitReason::Prompt,
                })
            }
            Behavior::Freeze => {
                tokio::select! {
                    () = cancel.cancelled() => Ok(ExecOutput {
                        text: String::new(),
                        reason: ExitReason::Cancelled,
                    }),
                    () = self.attention.notified() => Ok(ExecOutput {
                        text: String::new(),
                        reason: ExitReason::Cancelled,
                    }),
                    () = tokio::time::sleep(self.read_timeout) => Ok(ExecOutput {
                        text: String::new(),
                        reason: ExitReason::Timeout,
                    }),
                }
            }
            Behavior::ReadTimeout { partial } => {
                tokio::select! {
                    () = cancel.cancelled() => Ok(ExecOutput {
                        text: String::new(),
                        reason: ExitReason::Cancelled,
                    }),
                    () = tokio::time::sleep(Duration::from_millis(20)) => Ok(ExecOutput {
                        text: partial,
                        reason: ExitReason::Timeout,
                    }),
                }
            }
            Behavior::ExitChild => {
                self.active.store(false, Ordering::Release);
                Ok(ExecOutput {
                    text: String::new(),
                    reason: ExitReason::ChildExited,
                })
            }
        }
    }
}

#[async_trait]
impl ChildDriver for FakeDriver {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::AcqRel);
        if self.start_failures.load(Ordering::Acquire) > 0 {
            self.start_failures.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::Startup("fake debugger refused to start".into()));
        }
        if self.unfreeze_on_start.load(Ordering::Acquire) {
            self.frozen.store(false, Ordering::Release);
        }
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput> {
        if !self.active.load(Ordering::Acquire) {
            return Err(EngineError::ChildFault("debugger is not running".into()));
        }
        self.executed.lock().unwrap().push(command.to_string());

        // Clear the flag even when a probe drops this future at its timeout.
        struct FlagGuard<'a>(&'a AtomicBool);
        impl Drop for FlagGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        self.executing.store(true, Ordering::Release);
        let _executing = FlagGuard(&self.executing);
        self.execute_inner(command, cancel).await
    }

    async fn cancel_current(&self) {
        self.attention_signals.fetch_add(1, Ordering::AcqRel);
        if self.executing.load(Ordering::Acquire) {
            self.attention.notify_waiters();
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn process_id(&self) -> Option<u32> {
        self.is_active().then_some(4242)
    }
}

/// Factory that hands out fakes and remembers them so tests can script the
/// driver behind each session.
pub struct FakeDriverFactory {
    builder: Box<dyn Fn() -> Arc<FakeDriver> + Send + Sync>,
    created: Mutex<Vec<Arc<FakeDriver>>>,
}

impl FakeDriverFactory {
    pub fn new() -> Arc<Self> {
        Self::with_builder(FakeDriver::new)
    }

    pub fn with_builder(
        builder: impl Fn() -> Arc<FakeDriver> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            builder: Box::new(builder),
            created: Mutex::new(Vec::new()),
        })
    }

    /// The driver created for the most recent session.
    pub fn last(&self) -> Arc<FakeDriver> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no fake driver created yet")
    }

    pub fn all(&self) -> Vec<Arc<FakeDriver>> {
        self.created.lock().unwrap().clone()
    }
}

impl DriverFactory for FakeDriverFactory {
    fn create(&self, _spec: DriverSpec) -> Arc<dyn ChildDriver> {
        let driver = (self.builder)();
        self.created.lock().unwrap().push(driver.clone());
        driver
    }
}

/// Config with spec-default command timeouts; nothing times out in tests
/// that use it.
pub fn test_config(log_root: &std::path::Path) -> EngineConfig {
    EngineConfig {
        log_root: log_root.to_path_buf(),
        recovery_settle_delay: Duration::from_millis(50),
        health_probe_timeout: Duration::from_millis(500),
        queue_ready_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// Config with tight command deadlines for timeout and recovery tests.
pub fn fast_config(log_root: &std::path::Path) -> EngineConfig {
    EngineConfig {
        short_command_timeout: Duration::from_millis(300),
        default_command_timeout: Duration::from_millis(500),
        long_command_timeout: Duration::from_millis(800),
        ..test_config(log_root)
    }
}

/// A temp directory holding a plausible dump file. Keep the `TempDir` alive
/// for the duration of the test.
pub fn temp_dump() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let dump = dir.path().join("crash.dmp");
    std::fs::write(&dump, b"MDMP fake dump contents").expect("failed to write dump");
    (dir, dump.display().to_string())
}

// ---------------------------------------------------------------------------
// Queue harness: a command queue wired straight to a fake driver, bypassing
// the session manager.
// ---------------------------------------------------------------------------

use crashdbg::cache::ResultCache;
use crashdbg::notify::{CommandStatusEvent, Notification, NotificationBus, RecoveryEvent};
use crashdbg::queue::{CommandQueue, CommandRecord};
use crashdbg::recovery::RecoverySupervisor;
use crashdbg::session::SessionContext;
use tokio::sync::{mpsc, watch};

pub struct QueueHarness {
    pub ctx: Arc<SessionContext>,
    pub driver: Arc<FakeDriver>,
    pub cache: Arc<ResultCache>,
    pub bus: Arc<NotificationBus>,
    pub recovery: Arc<RecoverySupervisor>,
    pub queue: Arc<CommandQueue>,
    pub ready_tx: watch::Sender<bool>,
}

/// Build a queue over a started fake driver. `ready` controls whether the
/// worker may start dequeueing immediately.
pub async fn queue_harness(config: EngineConfig, ready: bool) -> QueueHarness {
    let ctx = SessionContext::new(
        "sess-000001-deadbeef-00000000-0000".to_string(),
        std::path::PathBuf::from("/tmp/fake.dmp"),
        None,
    );
    let driver = FakeDriver::new();
    driver.start().await.expect("fake driver start");

    let config = Arc::new(config);
    let cache = Arc::new(ResultCache::new(
        config.cache_max_bytes,
        config.cache_max_records,
    ));
    let bus = Arc::new(NotificationBus::new());
    let recovery =
        RecoverySupervisor::new(ctx.clone(), driver.clone(), bus.clone(), config.clone());
    let (ready_tx, ready_rx) = watch::channel(false);
    let queue = CommandQueue::spawn(
        ctx.clone(),
        config,
        driver.clone(),
        cache.clone(),
        bus.clone(),
        recovery.clone(),
        ready_rx,
    );
    recovery.attach_queue(&queue);
    recovery.note_healthy();

    if ready {
        let _ = ready_tx.send(true);
        assert!(queue.wait_ready(Duration::from_secs(2)).await);
    }

    QueueHarness {
        ctx,
        driver,
        cache,
        bus,
        recovery,
        queue,
        ready_tx,
    }
}

/// Poll until a command's record turns terminal. Panics past the budget.
pub async fn wait_terminal(queue: &CommandQueue, command_id: &str, budget: Duration) -> CommandRecord {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Some(record) = queue.get_info(command_id) {
            if record.state.is_terminal() {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command {command_id} did not finalize within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect up to `want` status events for one command within the budget.
pub async fn collect_command_events(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    command_id: &str,
    want: usize,
    budget: Duration,
) -> Vec<CommandStatusEvent> {
    let deadline = tokio::time::Instant::now() + budget;
    let mut events = Vec::new();
    while events.len() < want {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Notification::CommandStatus(event))) if event.command_id == command_id => {
                events.push(event);
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    events
}

/// Collect up to `want` recovery events for one session within the budget.
pub async fn collect_recovery_events(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    session_id: &str,
    want: usize,
    budget: Duration,
) -> Vec<RecoveryEvent> {
    let deadline = tokio::time::Instant::now() + budget;
    let mut events = Vec::new();
    while events.len() < want {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Notification::Recovery(event))) if event.session_id == session_id => {
                events.push(event);
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    events
}
