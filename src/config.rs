//! Process-wide engine configuration.
//!
//! One immutable [`EngineConfig`] is built at startup and shared (`Arc`) by
//! every component. Defaults match production debugger behavior; a handful of
//! knobs can be overridden through `CRASHDBG_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// All tunables for the session engine. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// A session idle longer than this is closed by the sweeper.
    pub session_timeout: Duration,
    /// How often the age-out sweeper runs.
    pub sweeper_interval: Duration,

    /// Per-session result cache cap in bytes.
    pub cache_max_bytes: usize,
    /// Per-session result cache cap in record count.
    pub cache_max_records: usize,

    /// Timeout for commands with no known category.
    pub default_command_timeout: Duration,
    /// Timeout for known-fast commands (stack walks, register dumps).
    pub short_command_timeout: Duration,
    /// Timeout for known-slow commands (`!analyze`, symbol reloads).
    pub long_command_timeout: Duration,

    /// Budget for the debugger child to reach its first prompt.
    pub child_start_timeout: Duration,
    /// Idle budget for a single read while waiting for command output.
    pub output_read_timeout: Duration,
    /// Extension granted per observed symbol-server download during startup.
    pub symbol_server_timeout: Duration,
    /// How many symbol-server extensions startup may consume.
    pub symbol_retry_count: u32,

    /// Explicit debugger binary path. `None` falls back to
    /// `CRASHDBG_DEBUGGER`, then PATH, then well-known install locations.
    pub debugger_path: Option<PathBuf>,
    /// Symbol search path handed to the debugger with its symbol flag.
    pub symbol_search_path: Option<String>,
    /// Root directory for per-session debugger log files.
    pub log_root: PathBuf,

    /// Bracket each command with a unique `.echo` sync marker so prompts
    /// inside command output cannot be mistaken for completion.
    pub use_sentinels: bool,

    /// Health probe results are cached this long to avoid probe storms.
    pub health_probe_interval: Duration,
    /// Budget for a single health probe command.
    pub health_probe_timeout: Duration,
    /// Pause between stopping and restarting a wedged debugger child.
    pub recovery_settle_delay: Duration,
    /// Consecutive recoveries without a healthy probe before the session
    /// is marked faulted.
    pub max_consecutive_recoveries: u32,

    /// How long session creation waits for the queue worker to come up.
    pub queue_ready_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_timeout: Duration::from_secs(30 * 60),
            sweeper_interval: Duration::from_secs(60),
            cache_max_bytes: 100 * 1024 * 1024,
            cache_max_records: 1000,
            default_command_timeout: Duration::from_secs(10 * 60),
            short_command_timeout: Duration::from_secs(2 * 60),
            long_command_timeout: Duration::from_secs(30 * 60),
            child_start_timeout: Duration::from_secs(30),
            output_read_timeout: Duration::from_secs(30),
            symbol_server_timeout: Duration::from_secs(90),
            symbol_retry_count: 2,
            debugger_path: None,
            symbol_search_path: None,
            log_root: std::env::temp_dir().join("crashdbg"),
            use_sentinels: false,
            health_probe_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(10),
            recovery_settle_delay: Duration::from_secs(2),
            max_consecutive_recoveries: 3,
            queue_ready_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults plus `CRASHDBG_*` environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CRASHDBG_DEBUGGER") {
            if !path.trim().is_empty() {
                config.debugger_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("CRASHDBG_SYMBOL_PATH") {
            if !path.trim().is_empty() {
                config.symbol_search_path = Some(path);
            }
        }
        if let Ok(root) = std::env::var("CRASHDBG_LOG_ROOT") {
            if !root.trim().is_empty() {
                config.log_root = PathBuf::from(root);
            }
        }
        if let Ok(max) = std::env::var("CRASHDBG_MAX_SESSIONS") {
            if let Ok(n) = max.trim().parse::<usize>() {
                if n > 0 {
                    config.max_sessions = n;
                }
            }
        }

        config
    }

    /// Per-session debugger log file path under `<log_root>/Sessions/`.
    #[must_use]
    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.log_root
            .join("Sessions")
            .join(format!("cdb_{session_id}.log"))
    }
}
