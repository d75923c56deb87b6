//! Session lifecycle: creation, the shared session table, activity-based
//! age-out, and teardown.
//!
//! Each session exclusively owns its debugger driver, command queue, and
//! result cache. The manager is the only writer of the session table; the
//! sweeper and the façade read snapshots. Creation runs under a single-slot
//! admission semaphore so the concurrency cap cannot be raced past.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::driver::{CdbDriverFactory, ChildDriver, DriverFactory, DriverSpec};
use crate::error::{EngineError, Result};
use crate::ids;
use crate::notify::{Notification, NotificationBus, SessionEvent, SessionEventKind};
use crate::queue::CommandQueue;
use crate::recovery::RecoverySupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Active,
    Closing,
    Closed,
    Faulted,
}

impl SessionStatus {
    /// Closed and Faulted never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Faulted)
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Initializing => 0,
            SessionStatus::Active => 1,
            SessionStatus::Closing => 2,
            SessionStatus::Closed => 3,
            SessionStatus::Faulted => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Initializing,
            1 => SessionStatus::Active,
            2 => SessionStatus::Closing,
            4 => SessionStatus::Faulted,
            _ => SessionStatus::Closed,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
            SessionStatus::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Shared per-session metadata: identity, times, status, shutdown signal.
pub struct SessionContext {
    pub session_id: String,
    pub dump_path: PathBuf,
    pub symbols_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    status: AtomicU8,
    /// Fires when the session is closing or faulted; every long operation
    /// owned by the session observes it.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    #[must_use]
    pub fn new(session_id: String, dump_path: PathBuf, symbols_path: Option<PathBuf>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            session_id,
            dump_path,
            symbols_path,
            created_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            status: AtomicU8::new(SessionStatus::Initializing.as_u8()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Set the status. Terminal states are sticky: once Closed or Faulted,
    /// the status never changes again.
    pub(crate) fn set_status(&self, next: SessionStatus) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if SessionStatus::from_u8(current).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Bump last-activity to now. Monotone under concurrent updates: the
    /// stored timestamp never regresses.
    pub fn touch(&self) {
        let now = Utc::now().timestamp_millis();
        self.last_activity_ms.fetch_max(now, Ordering::AcqRel);
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// How long the session has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        let idle_ms = (Utc::now().timestamp_millis() - last).max(0);
        Duration::from_millis(idle_ms as u64)
    }
}

/// One live session: context plus its exclusively-owned components.
pub struct Session {
    pub ctx: Arc<SessionContext>,
    pub driver: Arc<dyn ChildDriver>,
    pub queue: Arc<CommandQueue>,
    pub cache: Arc<ResultCache>,
    pub recovery: Arc<RecoverySupervisor>,
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub dump_path: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub pending_commands: usize,
    pub cached_results: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManagerStats {
    pub open_sessions: usize,
    pub max_sessions: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_expired: u64,
}

/// Owns the session table; the sole authority for create and close.
pub struct SessionManager {
    config: Arc<EngineConfig>,
    bus: Arc<NotificationBus>,
    factory: Arc<dyn DriverFactory>,
    sessions: DashMap<String, Arc<Session>>,
    admission: Semaphore,
    created: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    shutdown: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Production manager: sessions drive real debugger children.
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, bus: Arc<NotificationBus>) -> Arc<Self> {
        let factory = Arc::new(CdbDriverFactory::new(config.clone()));
        Self::with_factory(config, bus, factory)
    }

    /// Manager with an injected driver factory (tests wire a fake here).
    #[must_use]
    pub fn with_factory(
        config: Arc<EngineConfig>,
        bus: Arc<NotificationBus>,
        factory: Arc<dyn DriverFactory>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config: config.clone(),
            bus,
            factory,
            sessions: DashMap::new(),
            admission: Semaphore::new(1),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            sweeper: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::sweeper_loop(
            Arc::downgrade(&manager),
            config.sweeper_interval,
            manager.shutdown.clone(),
        ));
        *manager.sweeper.lock().expect("sweeper handle lock poisoned") = Some(handle);
        manager
    }

    /// Create a session: validate, admit, launch the debugger, wait for the
    /// queue worker, then activate. Any failure unwinds in reverse order and
    /// leaves no table entry.
    pub async fn create(&self, dump_path: &str, symbols_path: Option<&str>) -> Result<String> {
        ids::validate_dump_path(dump_path)?;
        ids::validate_symbols_path(symbols_path)?;

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("session admission closed".into()))?;

        let open = self.sessions.len();
        if open >= self.config.max_sessions {
            return Err(EngineError::SessionLimit {
                active: open,
                max: self.config.max_sessions,
            });
        }

        let session_id = ids::mint_session_id();
        let log_path = self.config.session_log_path(&session_id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Internal(format!("failed to create log root: {e}")))?;
        }

        let ctx = SessionContext::new(
            session_id.clone(),
            PathBuf::from(dump_path),
            symbols_path.map(PathBuf::from),
        );
        let driver = self.factory.create(DriverSpec {
            target: ctx.dump_path.clone(),
            symbols: ctx.symbols_path.clone(),
            log_path,
        });
        let cache = Arc::new(ResultCache::new(
            self.config.cache_max_bytes,
            self.config.cache_max_records,
        ));
        let recovery = RecoverySupervisor::new(
            ctx.clone(),
            driver.clone(),
            self.bus.clone(),
            self.config.clone(),
        );
        let (ready_tx, ready_rx) = watch::channel(false);
        let queue = CommandQueue::spawn(
            ctx.clone(),
            self.config.clone(),
            driver.clone(),
            cache.clone(),
            self.bus.clone(),
            recovery.clone(),
            ready_rx,
        );
        recovery.attach_queue(&queue);

        if let Err(e) = driver.start().await {
            ctx.set_status(SessionStatus::Closed);
            queue.dispose().await;
            tracing::warn!(session = %session_id, error = %e, "session creation failed at debugger start");
            return Err(e);
        }
        recovery.note_healthy();

        let session = Arc::new(Session {
            ctx: ctx.clone(),
            driver: driver.clone(),
            queue: queue.clone(),
            cache,
            recovery,
        });
        self.sessions.insert(session_id.clone(), session);

        let _ = ready_tx.send(true);
        if !queue.wait_ready(self.config.queue_ready_timeout).await {
            self.sessions.remove(&session_id);
            ctx.set_status(SessionStatus::Closed);
            queue.dispose().await;
            driver.stop().await;
            return Err(EngineError::Startup(
                "queue worker failed to become ready".into(),
            ));
        }

        ctx.set_status(SessionStatus::Active);
        ctx.touch();
        self.created.fetch_add(1, Ordering::Relaxed);

        self.publish_event(
            &ctx,
            SessionEventKind::Created,
            format!("session created for {dump_path}"),
        );
        tracing::info!(session = %session_id, dump = %dump_path, "session created");
        Ok(session_id)
    }

    /// Orderly close. Idempotent: false when the session is unknown.
    pub async fn close(&self, session_id: &str) -> bool {
        self.close_with_event(session_id, SessionEventKind::Closed, "session closed")
            .await
    }

    async fn close_with_event(
        &self,
        session_id: &str,
        kind: SessionEventKind,
        description: &str,
    ) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        session.ctx.set_status(SessionStatus::Closing);
        let cancelled = session.queue.cancel_all("session closing");
        if cancelled > 0 {
            tracing::debug!(session = %session_id, cancelled, "cancelled pending commands on close");
        }
        session.queue.dispose().await;
        session.driver.stop().await;
        session.cache.clear();
        session.ctx.set_status(SessionStatus::Closed);

        match kind {
            SessionEventKind::Expired => {
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.publish_event(&session.ctx, kind, description.to_string());
        tracing::info!(session = %session_id, event = ?kind, "session closed");
        true
    }

    #[must_use]
    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>> {
        ids::validate_session_id(session_id)?;
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    pub fn get_queue(&self, session_id: &str) -> Result<Arc<CommandQueue>> {
        Ok(self.get_session(session_id)?.queue.clone())
    }

    #[must_use]
    pub fn try_get_queue(&self, session_id: &str) -> Option<Arc<CommandQueue>> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().queue.clone())
    }

    pub fn get_context(&self, session_id: &str) -> Result<Arc<SessionContext>> {
        Ok(self.get_session(session_id)?.ctx.clone())
    }

    /// Report that a caller touched the session. Idempotent and monotone.
    pub fn update_activity(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.ctx.touch();
        }
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<SessionInfo> {
        self.list_all()
            .into_iter()
            .filter(|info| info.status == SessionStatus::Active)
            .collect()
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| Self::info_of(entry.value()))
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    fn info_of(session: &Session) -> SessionInfo {
        SessionInfo {
            session_id: session.ctx.session_id.clone(),
            dump_path: session.ctx.dump_path.display().to_string(),
            status: session.ctx.status(),
            created_at: session.ctx.created_at,
            last_activity: session.ctx.last_activity(),
            process_id: session.driver.process_id(),
            pending_commands: session.queue.pending(),
            cached_results: session.cache.len(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            open_sessions: self.sessions.len(),
            max_sessions: self.config.max_sessions,
            total_created: self.created.load(Ordering::Relaxed),
            total_closed: self.closed.load(Ordering::Relaxed),
            total_expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Close idle and faulted sessions. Returns how many idled out.
    pub async fn cleanup_expired(&self) -> usize {
        let mut idle_ids = Vec::new();
        let mut faulted_ids = Vec::new();
        for entry in self.sessions.iter() {
            let ctx = &entry.value().ctx;
            if ctx.status() == SessionStatus::Faulted {
                faulted_ids.push(ctx.session_id.clone());
            } else if ctx.idle_for() > self.config.session_timeout {
                idle_ids.push(ctx.session_id.clone());
            }
        }

        for id in faulted_ids {
            self.close_with_event(&id, SessionEventKind::Closed, "session faulted")
                .await;
        }

        let mut expired = 0;
        for id in idle_ids {
            if self
                .close_with_event(&id, SessionEventKind::Expired, "session idle timeout")
                .await
            {
                expired += 1;
            }
        }
        expired
    }

    /// Close everything and stop the sweeper. Safe to call twice.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .expect("sweeper handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_with_event(&id, SessionEventKind::Closed, "engine shutdown")
                .await;
        }
    }

    async fn sweeper_loop(
        manager: std::sync::Weak<SessionManager>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of an interval fires immediately; consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    let expired = manager.cleanup_expired().await;
                    if expired > 0 {
                        tracing::info!(expired, "sweeper closed idle sessions");
                    }
                }
            }
        }
    }

    fn publish_event(&self, ctx: &SessionContext, event: SessionEventKind, description: String) {
        self.bus.publish(Notification::Session(SessionEvent {
            session_id: ctx.session_id.clone(),
            event,
            description,
            dump_path: ctx.dump_path.display().to_string(),
            status: ctx.status(),
            timestamp: Utc::now(),
        }));
    }
}
