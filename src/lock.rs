// Install Lock
//
// Cross-process mutual exclusion for the extensions directory. The lock is a
// marker file created with `create_new`; its holder keeps the mtime fresh so
// other processes can tell a live lock from an abandoned one.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::error::{ExtensionError, ExtensionResult};

pub const LOCK_FILE_NAME: &str = "install.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct InstallLock {
    path: PathBuf,
    wait: Duration,
    stale: Duration,
}

/// A held lock. Dropping it removes the lock file on a best-effort basis;
/// prefer `release` in async code.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl InstallLock {
    /// Lock rooted in `dir` (`<dir>/install.lock`).
    pub fn new(dir: &Path, wait: Duration, stale: Duration) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
            wait,
            stale,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> ExtensionResult<LockGuard> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await;

            match created {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes()).await?;
                    file.flush().await?;
                    log::info!("Acquired install lock {}", self.path.display());
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        refresher: Some(self.spawn_refresher()),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale().await {
                        log::warn!("Removing stale install lock {}", self.path.display());
                        match tokio::fs::remove_file(&self.path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }

                    let waited = started.elapsed();
                    if waited >= self.wait {
                        return Err(ExtensionError::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    log::debug!("Install lock busy, waiting ({:?} elapsed)", waited);
                    tokio::time::sleep(POLL_INTERVAL.min(self.wait - waited)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `operation` while holding the lock. The lock is released whether
    /// the operation succeeds or fails.
    pub async fn with_lock<F, T>(&self, operation: F) -> ExtensionResult<T>
    where
        F: Future<Output = ExtensionResult<T>>,
    {
        let guard = self.acquire().await?;
        let result = operation.await;
        guard.release().await;
        result
    }

    async fn is_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified(),
            // Vanished between create and stat: just retry.
            Err(_) => return false,
        };
        match modified {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > self.stale)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn spawn_refresher(&self) -> JoinHandle<()> {
        let path = self.path.clone();
        let period = (self.stale / 2).max(MIN_REFRESH_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = touch(&path) {
                    log::warn!("Failed to refresh install lock {}: {}", path.display(), e);
                }
            }
        })
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::now())
}

impl LockGuard {
    pub async fn release(mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => log::debug!("Released install lock {}", self.path.display()),
            Err(e) => log::warn!("Failed to remove install lock {}: {}", self.path.display(), e),
        }
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
