//! Graceful Shutdown
//!
//! Coordinates shutdown of the consumer loop, the stage watcher and the
//! health server. Components take a [`CancellationToken`]; work that must
//! finish before the process exits registers a [`TaskGuard`] so the drain
//! phase can wait for it, up to the grace period.
//!
//! ```ignore
//! let shutdown = ShutdownController::with_grace(Duration::from_secs(30));
//! let token = shutdown.token();
//! tokio::spawn(async move { consumer.run(token).await });
//!
//! wait_for_shutdown_signal().await?;
//! shutdown.shutdown().await;
//! ```

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default grace period in seconds
const DEFAULT_GRACE_SECS: u64 = 30;

/// Shutdown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    /// Normal operation
    Running = 0,
    /// Shutdown requested; no new work is accepted
    Stopping = 1,
    /// Tokens cancelled; waiting for in-flight work
    Draining = 2,
    /// Grace period expired with work still running
    Terminating = 3,
    /// Shutdown complete
    Terminated = 4,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            2 => Self::Draining,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Draining => write!(f, "draining"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Shutdown controller shared by every long-running component
#[derive(Debug)]
pub struct ShutdownController {
    cancel_token: CancellationToken,
    phase: AtomicU8,
    initiated: AtomicBool,
    active_tasks: AtomicU32,
    grace: Duration,
}

impl ShutdownController {
    /// Controller with the default grace period
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_grace(Duration::from_secs(DEFAULT_GRACE_SECS))
    }

    /// Controller with a custom grace period
    #[must_use]
    pub fn with_grace(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancel_token: CancellationToken::new(),
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
            initiated: AtomicBool::new(false),
            active_tasks: AtomicU32::new(0),
            grace,
        })
    }

    /// A child token that fires when shutdown begins
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Current phase, as reported by the health endpoint
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether shutdown has been initiated
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Grace period for in-flight work
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Track a unit of in-flight work until the guard is dropped
    pub fn register_task(self: &Arc<Self>) -> TaskGuard {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            controller: Arc::clone(self),
        }
    }

    /// Number of registered tasks still running
    #[must_use]
    pub fn active_task_count(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Cancel every token, then wait up to the grace period for registered
    /// tasks. Returns true if everything drained in time. Only the first
    /// call does anything.
    pub async fn shutdown(&self) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already initiated");
            return self.phase() == ShutdownPhase::Terminated;
        }

        self.set_phase(ShutdownPhase::Stopping);
        self.set_phase(ShutdownPhase::Draining);
        self.cancel_token.cancel();

        let deadline = tokio::time::Instant::now() + self.grace;
        let check_interval = Duration::from_millis(50);
        let mut drained = true;

        loop {
            let active = self.active_task_count();
            if active == 0 {
                info!("All in-flight work completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    active_tasks = active,
                    grace_secs = self.grace.as_secs(),
                    "Grace period exceeded, abandoning in-flight work"
                );
                self.set_phase(ShutdownPhase::Terminating);
                drained = false;
                break;
            }
            tokio::time::sleep(check_interval).await;
        }

        self.set_phase(ShutdownPhase::Terminated);
        drained
    }
}

/// Decrements the active task count when dropped
#[derive(Debug)]
pub struct TaskGuard {
    controller: Arc<ShutdownController>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.controller.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| Error::Internal(format!("failed to install SIGTERM handler: {e}")))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| Error::Internal(format!("failed to listen for Ctrl+C: {e}")))?;
                info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Internal(format!("failed to listen for Ctrl+C: {e}")))?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
