//! Debugger child driver: launch, feed stdin, read prompt-delimited output,
//! interrupt, and tear down one command-line debugger process.
//!
//! The [`ChildDriver`] trait is the seam the rest of the engine is written
//! against; production uses [`CdbDriver`], tests wire in a scripted fake
//! through [`DriverFactory`]. Only the queue worker calls `execute`;
//! `cancel_current` may be called from any task and is a no-op when no
//! command is in flight.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::parser;

/// Why `execute` stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The debugger emitted its prompt; the command is complete.
    Prompt,
    /// No output arrived within the read timeout.
    Timeout,
    /// The cancel signal fired mid-read.
    Cancelled,
    /// The debugger child exited while we were reading.
    ChildExited,
}

/// Output accumulated for one command plus the reason reading stopped.
/// On `Timeout`/`Cancelled`/`ChildExited` the text is partial.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub text: String,
    pub reason: ExitReason,
}

/// Narrow interface over one debugger child process.
#[async_trait]
pub trait ChildDriver: Send + Sync {
    /// Launch the debugger and wait for its first prompt.
    async fn start(&self) -> Result<()>;

    /// Write one command and read until prompt, cancel, or read timeout.
    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput>;

    /// Best-effort interrupt of the in-flight command. Idempotent; no effect
    /// when nothing is executing.
    async fn cancel_current(&self);

    /// Quit politely, then kill after a grace period. Safe to call twice.
    async fn stop(&self);

    fn is_active(&self) -> bool;

    fn process_id(&self) -> Option<u32>;
}

/// Everything a factory needs to build a driver for one session.
#[derive(Debug, Clone)]
pub struct DriverSpec {
    /// Dump file (or executable) the debugger opens.
    pub target: PathBuf,
    /// Per-session symbol path override.
    pub symbols: Option<PathBuf>,
    /// Per-session debugger log file.
    pub log_path: PathBuf,
}

/// Builds the driver for a new session. Swapped for a fake in tests.
pub trait DriverFactory: Send + Sync {
    fn create(&self, spec: DriverSpec) -> Arc<dyn ChildDriver>;
}

/// Production factory: one [`CdbDriver`] per session.
pub struct CdbDriverFactory {
    config: Arc<EngineConfig>,
}

impl CdbDriverFactory {
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

impl DriverFactory for CdbDriverFactory {
    fn create(&self, spec: DriverSpec) -> Arc<dyn ChildDriver> {
        Arc::new(CdbDriver::new(self.config.clone(), spec))
    }
}

/// Target extensions that select the debugger's dump mode.
const DUMP_EXTENSIONS: &[&str] = &["dmp", "mdmp", "hdmp", "kdmp", "dump"];

/// Binary names probed on PATH.
const BINARY_NAMES: &[&str] = &["cdb", "cdb.exe"];

/// Install locations probed after PATH.
const WELL_KNOWN_LOCATIONS: &[&str] = &[
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x64\cdb.exe",
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x86\cdb.exe",
    r"C:\Program Files\Windows Kits\10\Debuggers\x64\cdb.exe",
    "/usr/local/bin/cdb",
    "/usr/bin/cdb",
];

/// Grace period between the quit command and a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(2);
const KILL_WAIT: Duration = Duration::from_secs(1);

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    /// Output lines merged from stdout and stderr. A prompt with no trailing
    /// newline is delivered as its own line by the pump.
    lines: mpsc::UnboundedReceiver<String>,
}

/// Drives one CDB-style debugger child over plain pipes.
pub struct CdbDriver {
    config: Arc<EngineConfig>,
    spec: DriverSpec,
    io: Mutex<Option<ChildIo>>,
    pid: AtomicU32,
    active: AtomicBool,
    executing: AtomicBool,
}

impl CdbDriver {
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, spec: DriverSpec) -> Self {
        Self {
            config,
            spec,
            io: Mutex::new(None),
            pid: AtomicU32::new(0),
            active: AtomicBool::new(false),
            executing: AtomicBool::new(false),
        }
    }

    /// Resolve the debugger binary: explicit config path, then the
    /// `CRASHDBG_DEBUGGER` environment variable, then PATH, then well-known
    /// install locations.
    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.debugger_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(EngineError::Startup(format!(
                "configured debugger binary does not exist: {}",
                path.display()
            )));
        }

        if let Ok(env_path) = std::env::var("CRASHDBG_DEBUGGER") {
            let path = PathBuf::from(env_path.trim());
            if path.exists() {
                return Ok(path);
            }
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                for name in BINARY_NAMES {
                    let candidate = dir.join(name);
                    if candidate.is_file() {
                        return Ok(candidate);
                    }
                }
            }
        }

        for location in WELL_KNOWN_LOCATIONS {
            let candidate = Path::new(location);
            if candidate.is_file() {
                return Ok(candidate.to_path_buf());
            }
        }

        Err(EngineError::Startup(
            "debugger binary not found (set CRASHDBG_DEBUGGER or configure an explicit path)"
                .into(),
        ))
    }

    fn is_dump_target(&self) -> bool {
        self.spec
            .target
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .is_some_and(|ext| DUMP_EXTENSIONS.contains(&ext.as_str()))
    }

    fn build_command(&self, binary: &Path) -> Command {
        let mut cmd = Command::new(binary);

        let symbols = self
            .spec
            .symbols
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| self.config.symbol_search_path.clone());
        if let Some(symbols) = symbols {
            cmd.arg("-y").arg(symbols);
        }

        cmd.arg("-logo").arg(&self.spec.log_path);

        if self.is_dump_target() {
            cmd.arg("-z").arg(&self.spec.target);
        } else {
            cmd.arg(&self.spec.target);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Wait for the first prompt, extending the deadline while the debugger
    /// is visibly pulling symbols from a symbol server.
    async fn await_first_prompt(&self, lines: &mut mpsc::UnboundedReceiver<String>) -> Result<()> {
        let mut extensions_left = self.config.symbol_retry_count;
        let mut deadline = Instant::now() + self.config.child_start_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Startup(
                    "timed out waiting for the first debugger prompt".into(),
                ));
            }
            match timeout(deadline - now, lines.recv()).await {
                Err(_) => continue,
                Ok(None) => {
                    return Err(EngineError::Startup(
                        "debugger exited before its first prompt".into(),
                    ));
                }
                Ok(Some(line)) => {
                    if parser::is_command_complete(&line) {
                        return Ok(());
                    }
                    if is_symbol_server_progress(&line) && extensions_left > 0 {
                        extensions_left -= 1;
                        deadline = Instant::now() + self.config.symbol_server_timeout;
                        tracing::debug!(
                            target = %self.spec.target.display(),
                            "symbol server activity during startup, extending deadline"
                        );
                    }
                }
            }
        }
    }

    async fn execute_inner(
        &self,
        io: &mut ChildIo,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let write = async {
            io.stdin.write_all(command.as_bytes()).await?;
            io.stdin.write_all(b"\n").await?;
            Ok::<_, std::io::Error>(())
        };
        write
            .await
            .map_err(|e| EngineError::ChildFault(format!("failed to write command: {e}")))?;

        let marker = if self.config.use_sentinels {
            let marker = parser::sync_marker(&uuid::Uuid::new_v4().to_string());
            let echo = parser::sync_echo_command(&marker);
            io.stdin
                .write_all(format!("{echo}\n").as_bytes())
                .await
                .map_err(|e| EngineError::ChildFault(format!("failed to write sync marker: {e}")))?;
            Some(marker)
        } else {
            None
        };
        io.stdin
            .flush()
            .await
            .map_err(|e| EngineError::ChildFault(format!("failed to flush command: {e}")))?;

        let mut out = String::new();
        let mut saw_marker = marker.is_none();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Ok(ExecOutput { text: out, reason: ExitReason::Cancelled });
                }
                next = timeout(self.config.output_read_timeout, io.lines.recv()) => {
                    match next {
                        Err(_) => return Ok(ExecOutput { text: out, reason: ExitReason::Timeout }),
                        Ok(None) => return Ok(ExecOutput { text: out, reason: ExitReason::ChildExited }),
                        Ok(Some(line)) => {
                            if let Some(marker) = &marker {
                                if parser::is_sync_marker(&line, marker) {
                                    saw_marker = true;
                                    continue;
                                }
                            }
                            if parser::is_command_complete(&line) {
                                if saw_marker {
                                    return Ok(ExecOutput { text: out, reason: ExitReason::Prompt });
                                }
                                // Prompt ahead of the sync marker does not
                                // complete the command.
                                continue;
                            }
                            if parser::is_internal_marker(&line) {
                                continue;
                            }
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(&line);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChildDriver for CdbDriver {
    async fn start(&self) -> Result<()> {
        let mut guard = self.io.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let binary = self.resolve_binary()?;
        if let Some(parent) = self.spec.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Startup(format!("failed to create log dir: {e}")))?;
        }

        let mut child = self
            .build_command(&binary)
            .spawn()
            .map_err(|e| EngineError::Startup(format!("failed to launch {}: {e}", binary.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Startup("debugger stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Startup("debugger stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Startup("debugger stderr was not piped".into()))?;

        let (tx, mut lines) = mpsc::unbounded_channel();
        tokio::spawn(pump_stdout(stdout, tx.clone()));
        tokio::spawn(pump_stderr(stderr, tx));

        if let Err(e) = self.await_first_prompt(&mut lines).await {
            let _ = child.start_kill();
            let _ = timeout(KILL_WAIT, child.wait()).await;
            return Err(e);
        }

        self.pid.store(child.id().unwrap_or(0), Ordering::Release);
        *guard = Some(ChildIo {
            child,
            stdin,
            lines,
        });
        self.active.store(true, Ordering::Release);
        tracing::info!(
            target = %self.spec.target.display(),
            pid = self.pid.load(Ordering::Acquire),
            "debugger child ready"
        );
        Ok(())
    }

    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| EngineError::ChildFault("debugger is not running".into()))?;

        // Drop stale output left over from a previous interrupted command.
        while io.lines.try_recv().is_ok() {}

        // The flag must clear even if this future is dropped at a timeout.
        self.executing.store(true, Ordering::Release);
        let _executing = FlagGuard(&self.executing);
        let result = self.execute_inner(io, command, cancel).await;

        let fatal = match &result {
            Ok(out) => out.reason == ExitReason::ChildExited,
            Err(_) => true,
        };
        if fatal {
            self.active.store(false, Ordering::Release);
        }
        result
    }

    async fn cancel_current(&self) {
        if !self.executing.load(Ordering::Acquire) {
            return;
        }
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return;
        }
        // The debugger treats an interrupt as its attention signal; it may
        // or may not produce an immediate prompt.
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        );
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::Release);
        let mut guard = self.io.lock().await;
        let Some(io) = guard.take() else {
            self.pid.store(0, Ordering::Release);
            return;
        };

        let ChildIo {
            mut child,
            mut stdin,
            lines,
        } = io;

        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
        drop(stdin);
        drop(lines);

        if timeout(STOP_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = timeout(KILL_WAIT, child.wait()).await;
        }
        self.pid.store(0, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Clears an atomic flag on drop, including cancellation drops.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn is_symbol_server_progress(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("symsrv") || lower.contains("downloading")
}

/// Read stdout in chunks, emitting newline-terminated lines and, crucially,
/// a pending prompt tail: the debugger prints its prompt without a trailing
/// newline, so a line-based reader would never deliver it.
async fn pump_stdout(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut stdout = stdout;
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = acc.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw)
                        .trim_end_matches(|c| c == '\r' || c == '\n')
                        .to_string();
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                if !acc.is_empty() {
                    let tail = String::from_utf8_lossy(&acc).to_string();
                    if parser::is_command_complete(tail.trim()) {
                        acc.clear();
                        if tx.send(tail.trim_end().to_string()).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Merge stderr lines into the same channel as stdout.
async fn pump_stderr(
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<String>,
) {
    let reader = BufReader::new(stderr);
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            return;
        }
    }
}
