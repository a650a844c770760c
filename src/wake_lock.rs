//! Screen/system wake lock
//!
//! The viewing side keeps the device awake while a session is live. A lock
//! is held through a `WakeLockGuard`, which releases it on drop, so the lock
//! cannot outlive the session that took it whichever way the session ends.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Platform wake lock
#[async_trait]
pub trait WakeLock: Send + Sync {
    fn name(&self) -> &'static str;

    async fn acquire(&self) -> Result<()>;

    /// Must be safe to call when not held
    fn release(&self);
}

/// Scoped hold on a `WakeLock`
pub struct WakeLockGuard {
    lock: Option<Arc<dyn WakeLock>>,
}

impl WakeLockGuard {
    pub async fn acquire(lock: Arc<dyn WakeLock>) -> Result<Self> {
        lock.acquire().await?;
        info!("Wake lock '{}' acquired", lock.name());
        Ok(Self { lock: Some(lock) })
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
            info!("Wake lock '{}' released", lock.name());
        }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Wake lock held by a `systemd-inhibit` child process
///
/// The inhibitor lives as long as the child; killing the child releases it.
pub struct InhibitWakeLock {
    who: String,
    child: Mutex<Option<Child>>,
}

impl InhibitWakeLock {
    pub fn new(who: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WakeLock for InhibitWakeLock {
    fn name(&self) -> &'static str {
        "systemd-inhibit"
    }

    async fn acquire(&self) -> Result<()> {
        if self.child.lock().is_some() {
            return Ok(());
        }

        let child = Command::new("systemd-inhibit")
            .arg("--what=idle:sleep")
            .arg(format!("--who={}", self.who))
            .arg("--why=Camera session active")
            .arg("--mode=block")
            .args(["sleep", "infinity"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::unsupported("wake_lock", e.to_string()))?;

        debug!("systemd-inhibit started with PID {:?}", child.id());
        *self.child.lock() = Some(child);
        Ok(())
    }

    fn release(&self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop systemd-inhibit: {}", e);
            }
        }
    }
}

/// Wake lock for platforms without one; acquisition always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLock;

#[async_trait]
impl WakeLock for NoWakeLock {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn acquire(&self) -> Result<()> {
        Err(AppError::unsupported(
            "wake_lock",
            "no wake lock available on this platform",
        ))
    }

    fn release(&self) {}
}
