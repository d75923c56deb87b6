//! Recovery: health probing and cancel-then-restart escalation for a wedged
//! debugger child.
//!
//! Every entry point is best-effort. Recovery never re-runs in-flight
//! commands (they are already finalized Failed or Cancelled by the queue)
//! and folds its own failures into RecoveryEvent notifications rather than
//! propagating them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::driver::{ChildDriver, ExitReason};
use crate::notify::{Notification, NotificationBus, RecoveryEvent, RecoveryStep};
use crate::parser;
use crate::queue::CommandQueue;
use crate::session::{SessionContext, SessionStatus};

/// Trivial no-op used to check whether the debugger still answers.
const HEALTH_PROBE_COMMAND: &str = ".echo crashdbg_health_probe";

pub struct RecoverySupervisor {
    ctx: Arc<SessionContext>,
    driver: Arc<dyn ChildDriver>,
    bus: Arc<NotificationBus>,
    config: Arc<EngineConfig>,
    /// Wired after the queue is built; recovery cancels through it.
    queue: OnceLock<Weak<CommandQueue>>,
    /// Serializes probes and recoveries so concurrent triggers collapse.
    gate: tokio::sync::Mutex<()>,
    probe_cache: Mutex<Option<(Instant, bool)>>,
    consecutive: AtomicU32,
}

impl RecoverySupervisor {
    #[must_use]
    pub fn new(
        ctx: Arc<SessionContext>,
        driver: Arc<dyn ChildDriver>,
        bus: Arc<NotificationBus>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            driver,
            bus,
            config,
            queue: OnceLock::new(),
            gate: tokio::sync::Mutex::new(()),
            probe_cache: Mutex::new(None),
            consecutive: AtomicU32::new(0),
        })
    }

    /// Wire the queue in after construction (queue and recovery reference
    /// each other; recovery holds the weak side).
    pub fn attach_queue(&self, queue: &Arc<CommandQueue>) {
        let _ = self.queue.set(Arc::downgrade(queue));
    }

    fn queue(&self) -> Option<Arc<CommandQueue>> {
        self.queue.get().and_then(Weak::upgrade)
    }

    /// Record a healthy observation: fresh cache entry, counter reset.
    pub fn note_healthy(&self) {
        *self.probe_cache.lock().expect("probe cache lock poisoned") =
            Some((Instant::now(), true));
        self.consecutive.store(0, Ordering::Release);
    }

    fn invalidate_probe(&self) {
        *self.probe_cache.lock().expect("probe cache lock poisoned") = None;
    }

    fn cached_probe(&self) -> Option<bool> {
        let cache = self.probe_cache.lock().expect("probe cache lock poisoned");
        cache.and_then(|(at, ok)| {
            (at.elapsed() < self.config.health_probe_interval).then_some(ok)
        })
    }

    /// Cached health check. On a cache miss, sends a no-op command with its
    /// own small budget; healthy iff it prompts back with no error text.
    pub async fn is_session_healthy(&self) -> bool {
        if self.ctx.status() == SessionStatus::Faulted {
            return false;
        }
        if let Some(ok) = self.cached_probe() {
            return ok;
        }
        let _gate = self.gate.lock().await;
        if let Some(ok) = self.cached_probe() {
            return ok;
        }
        let ok = self.probe().await;
        *self.probe_cache.lock().expect("probe cache lock poisoned") =
            Some((Instant::now(), ok));
        if ok {
            self.consecutive.store(0, Ordering::Release);
        }
        ok
    }

    async fn probe(&self) -> bool {
        if !self.driver.is_active() {
            return false;
        }
        let token = CancellationToken::new();
        let probe = self.driver.execute(HEALTH_PROBE_COMMAND, &token);
        match tokio::time::timeout(self.config.health_probe_timeout, probe).await {
            Ok(Ok(out)) => {
                out.reason == ExitReason::Prompt && !parser::classify(&out.text).has_error
            }
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Two-stage recovery: cancel in place, then force-restart. Returns
    /// whether the session ended up with a responsive debugger.
    pub async fn recover(&self, reason: &str) -> bool {
        let _gate = self.gate.lock().await;

        if self.ctx.status() == SessionStatus::Faulted {
            return false;
        }

        let attempt = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > self.config.max_consecutive_recoveries {
            self.fault_session(reason);
            return false;
        }

        tracing::warn!(
            session = %self.ctx.session_id,
            attempt,
            reason = %reason,
            "recovery started"
        );
        self.emit(RecoveryStep::Started, true, reason);

        // Stage one: cancel in place and see if the debugger comes back.
        if let Some(queue) = self.queue() {
            let cancelled = queue.cancel_all(reason);
            if cancelled > 0 {
                tracing::debug!(
                    session = %self.ctx.session_id,
                    cancelled,
                    "recovery cancelled pending commands"
                );
            }
        }
        self.driver.cancel_current().await;
        self.invalidate_probe();

        let healthy = self.probe().await;
        self.emit(RecoveryStep::CancelInPlace, healthy, reason);
        if healthy {
            self.note_healthy();
            return true;
        }

        // Stage two: force restart on the same target.
        self.driver.stop().await;
        tokio::time::sleep(self.config.recovery_settle_delay).await;
        match self.driver.start().await {
            Ok(()) => {
                // Leave the probe cache cold: only a real probe after the
                // restart counts as an intervening healthy observation.
                self.invalidate_probe();
                self.emit(RecoveryStep::Restart, true, reason);
                tracing::info!(session = %self.ctx.session_id, "debugger restarted");
                true
            }
            Err(e) => {
                self.emit(RecoveryStep::Restart, false, &format!("{reason}: {e}"));
                if attempt >= self.config.max_consecutive_recoveries {
                    self.fault_session(reason);
                }
                false
            }
        }
    }

    /// Number of recoveries since the last healthy probe.
    #[must_use]
    pub fn consecutive_recoveries(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    fn fault_session(&self, reason: &str) {
        tracing::error!(
            session = %self.ctx.session_id,
            reason = %reason,
            "session faulted after repeated recovery failures"
        );
        self.ctx.set_status(SessionStatus::Faulted);
        self.emit(RecoveryStep::Faulted, false, reason);
        // The sweeper tears faulted sessions down.
        self.ctx.shutdown.cancel();
    }

    fn emit(&self, step: RecoveryStep, success: bool, reason: &str) {
        self.bus.publish(Notification::Recovery(RecoveryEvent {
            session_id: self.ctx.session_id.clone(),
            step,
            success,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        }));
    }
}
