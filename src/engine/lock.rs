//! Cross-process drain lock.
//!
//! Drain passes from different processes (worker daemons, cron jobs, one-off
//! operator runs) coordinate through an advisory file lock so at most one
//! pass runs at a time.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::NotificationConfig;

/// Poll interval while waiting for a held lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("drain lock is held by another process")]
    AlreadyLocked,
    #[error("timed out after {0}s waiting for the drain lock")]
    Timeout(i64),
    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Acquires the advisory lock guarding drain passes.
pub struct DrainLock {
    path: PathBuf,
    wait_timeout_secs: i64,
}

impl DrainLock {
    /// A lock at `<dir>/<name>.lock`.
    ///
    /// `wait_timeout_secs` controls what happens when the lock is held:
    /// a non-positive value fails immediately with `AlreadyLocked`, a
    /// positive value polls for up to that many seconds before `Timeout`.
    pub fn new(dir: &Path, name: &str, wait_timeout_secs: i64) -> Self {
        Self {
            path: dir.join(format!("{name}.lock")),
            wait_timeout_secs,
        }
    }

    pub fn from_config(notification: &NotificationConfig) -> Self {
        Self::new(
            &notification.lock_dir,
            &notification.lock_name,
            notification.lock_wait_timeout_secs,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, waiting per the configured timeout.
    ///
    /// The returned guard holds the lock until dropped.
    pub async fn acquire(&self) -> Result<DrainLockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        if file.try_lock_exclusive().is_ok() {
            return Ok(DrainLockGuard { file });
        }
        if self.wait_timeout_secs <= 0 {
            return Err(LockError::AlreadyLocked);
        }

        let deadline = Instant::now() + Duration::from_secs(self.wait_timeout_secs as u64);
        loop {
            tokio::time::sleep(RETRY_INTERVAL).await;
            if file.try_lock_exclusive().is_ok() {
                return Ok(DrainLockGuard { file });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(self.wait_timeout_secs));
            }
        }
    }
}

/// Holds the drain lock; dropping it releases the lock.
///
/// The lock file itself is left in place. Removing it would let a racing
/// process lock a fresh inode while the old one is still held.
pub struct DrainLockGuard {
    file: File,
}

impl Drop for DrainLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DrainLock::new(dir.path(), "send_notices", -1);

        let guard = lock.acquire().await.unwrap();
        assert!(lock.path().exists());
        drop(guard);

        // Released on drop, so a second acquire succeeds.
        let _guard = lock.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_lock_fails_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DrainLock::new(dir.path(), "send_notices", -1);
        let other = DrainLock::new(dir.path(), "send_notices", -1);

        let _guard = lock.acquire().await.unwrap();
        assert!(matches!(
            other.acquire().await,
            Err(LockError::AlreadyLocked)
        ));
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DrainLock::new(dir.path(), "send_notices", -1);
        let patient = DrainLock::new(dir.path(), "send_notices", 1);

        let _guard = lock.acquire().await.unwrap();
        assert!(matches!(patient.acquire().await, Err(LockError::Timeout(1))));
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DrainLock::new(dir.path(), "send_notices", -1);
        let other = DrainLock::new(dir.path(), "sweep", -1);

        let _a = lock.acquire().await.unwrap();
        let _b = other.acquire().await.unwrap();
    }
}
