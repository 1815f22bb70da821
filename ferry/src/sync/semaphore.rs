use std::sync::Arc;
#[cfg(unix)]
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Lock, Semaphore, SyncError};
#[cfg(unix)]
use super::mutex::{MAX_BACKOFF, MIN_BACKOFF, try_lock};

/// In-process counting semaphore. Waiters are served in arrival order.
#[derive(Debug, Clone)]
pub struct LocalSemaphore {
    permits: Arc<tokio::sync::Semaphore>,
    size: usize,
}

impl LocalSemaphore {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(size)),
            size,
        }
    }

    /// Slots free right now, `0..=size`.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Semaphore for LocalSemaphore {
    fn size(&self) -> usize {
        self.size
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| SyncError::Closed)?
            }
        };
        Ok(Lock::new("local semaphore", move || drop(permit)))
    }
}

/// Cross-process semaphore over `size` lock files `<base>.0 .. <base>.{size-1}`.
///
/// Holding a slot means holding an exclusive `flock(2)` on its file. The
/// kernel offers no wait-for-any over several files, so a full semaphore is
/// re-probed with backoff capped at 50ms.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct FileSemaphore {
    slots: Arc<Vec<PathBuf>>,
    next: Arc<AtomicUsize>,
}

#[cfg(unix)]
impl FileSemaphore {
    pub fn new(base: impl AsRef<Path>, size: usize) -> Self {
        let base = base.as_ref();
        let slots = (0..size)
            .map(|i| {
                let mut name = OsString::from(base.as_os_str());
                name.push(format!(".{i}"));
                PathBuf::from(name)
            })
            .collect();
        Self {
            slots: Arc::new(slots),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Try every slot once, starting at `start`.
    fn try_any(
        slots: &[PathBuf],
        start: usize,
    ) -> Result<Option<nix::fcntl::Flock<std::fs::File>>, SyncError> {
        for offset in 0..slots.len() {
            if let Some(flock) = try_lock(&slots[(start + offset) % slots.len()])? {
                return Ok(Some(flock));
            }
        }
        Ok(None)
    }
}

#[cfg(unix)]
#[async_trait]
impl Semaphore for FileSemaphore {
    fn size(&self) -> usize {
        self.slots.len()
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        let mut backoff = MIN_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let slots = Arc::clone(&self.slots);
            let start = self.next.fetch_add(1, Ordering::Relaxed);
            let probe = tokio::task::spawn_blocking(move || Self::try_any(&slots, start))
                .await
                .map_err(|e| SyncError::Io {
                    path: PathBuf::new(),
                    source: std::io::Error::other(e),
                })??;
            if let Some(flock) = probe {
                return Ok(Lock::new("file semaphore", move || drop(flock)));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    async fn exercise(semaphore: &dyn Semaphore) {
        assert_eq!(semaphore.size(), 2);
        let mut a = semaphore.acquire(&never()).await.unwrap();
        let mut b = semaphore.acquire(&never()).await.unwrap();

        let cancel = CancellationToken::new();
        let timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            timeout.cancel();
        });
        assert!(matches!(semaphore.acquire(&cancel).await, Err(SyncError::Cancelled)));

        a.release().unwrap();
        let mut c = tokio::time::timeout(Duration::from_secs(5), semaphore.acquire(&never()))
            .await
            .unwrap()
            .unwrap();
        b.release().unwrap();
        c.release().unwrap();
    }

    #[tokio::test]
    async fn local_semaphore_bounds_holders() {
        let semaphore = LocalSemaphore::new(2);
        exercise(&semaphore).await;
        assert_eq!(semaphore.available(), 2);
    }

    #[tokio::test]
    async fn file_semaphore_bounds_holders() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileSemaphore::new(dir.path().join("sem"), 2)).await;
        assert!(dir.path().join("sem.0").exists());
        assert!(dir.path().join("sem.1").exists());
    }

    #[tokio::test]
    async fn local_semaphore_counts_down_and_back() {
        let semaphore = LocalSemaphore::new(3);
        let mut held = Vec::new();
        for expected in [2, 1, 0] {
            held.push(semaphore.acquire(&never()).await.unwrap());
            assert_eq!(semaphore.available(), expected);
        }
        for mut lock in held {
            lock.release().unwrap();
        }
        assert_eq!(semaphore.available(), 3);
    }
}
