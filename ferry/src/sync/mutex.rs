use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(unix)]
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Lock, Mutex, SyncError};

/// In-process mutex. Waiters are served in arrival order.
#[derive(Debug, Clone)]
pub struct LocalMutex {
    slot: Arc<tokio::sync::Semaphore>,
}

impl Default for LocalMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMutex {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(tokio::sync::Semaphore::new(1)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

#[async_trait]
impl Mutex for LocalMutex {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            permit = Arc::clone(&self.slot).acquire_owned() => {
                permit.map_err(|_| SyncError::Closed)?
            }
        };
        Ok(Lock::new("local mutex", move || drop(permit)))
    }
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Re-probe interval bounds for the `flock(2)` based primitives.
#[cfg(unix)]
pub(super) const MIN_BACKOFF: Duration = Duration::from_millis(5);
#[cfg(unix)]
pub(super) const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Take an exclusive `flock(2)` on `path` if nobody holds it.
#[cfg(unix)]
pub(super) fn try_lock(path: &Path) -> Result<Option<nix::fcntl::Flock<File>>, SyncError> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let file = open_lock_file(path).map_err(|e| SyncError::io(path, e))?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(flock) => Ok(Some(flock)),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(SyncError::io(path, errno.into())),
    }
}

/// Cross-process mutex: an exclusive `flock(2)` on `path`.
///
/// A held lock is re-probed with backoff capped at 50ms, so an abandoned wait
/// leaves nothing behind. Handles in the same process exclude each other too,
/// since every acquire opens the file afresh.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct FileMutex {
    path: Arc<PathBuf>,
}

#[cfg(unix)]
impl FileMutex {
    /// The lock file is created on first acquire.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl Mutex for FileMutex {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        let mut backoff = MIN_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let path = Arc::clone(&self.path);
            let probe = tokio::task::spawn_blocking(move || try_lock(&path))
                .await
                .map_err(|e| SyncError::io(self.path.to_path_buf(), io::Error::other(e)))??;
            if let Some(flock) = probe {
                tracing::trace!(path = %self.path.display(), "File mutex acquired");
                return Ok(Lock::new("file mutex", move || drop(flock)));
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
    use std::time::{Duration, Instant};

    async fn hold_twice(mutex: impl Mutex + Clone + 'static) -> Duration {
        let started = Instant::now();
        let critical = |m: Box<dyn Mutex>| async move {
            let mut lock = m.acquire(&CancellationToken::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            lock.release().unwrap();
        };
        tokio::join!(
            critical(Box::new(mutex.clone())),
            critical(Box::new(mutex.clone()))
        );
        started.elapsed()
    }

    #[tokio::test]
    async fn local_mutex_serializes_holders() {
        assert!(hold_twice(LocalMutex::new()).await >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn file_mutex_serializes_holders() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = FileMutex::new(dir.path().join("m.lock"));
        assert!(hold_twice(mutex).await >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_lock_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.lock");
        let mutexes: Vec<Box<dyn Mutex>> =
            vec![Box::new(LocalMutex::new()), Box::new(FileMutex::new(&path))];

        for mutex in mutexes {
            let mut held = mutex.acquire(&CancellationToken::new()).await.unwrap();

            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                canceller.cancel();
            });
            assert!(matches!(mutex.acquire(&cancel).await, Err(SyncError::Cancelled)));

            held.release().unwrap();
            let mut again = tokio::time::timeout(
                Duration::from_secs(5),
                mutex.acquire(&CancellationToken::new()),
            )
            .await
            .unwrap()
            .unwrap();
            again.release().unwrap();
        }
    }

    #[tokio::test]
    async fn abandoned_file_waits_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.lock");
        let mutex = FileMutex::new(&path);
        let mut held = mutex.acquire(&CancellationToken::new()).await.unwrap();

        for _ in 0..8 {
            let cancel = CancellationToken::new();
            let waiting = {
                let mutex = mutex.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { mutex.acquire(&cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
            assert!(matches!(waiting.await.unwrap(), Err(SyncError::Cancelled)));
        }
        held.release().unwrap();

        // No leftover waiter grabs the lock once it is free.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let flock = try_lock(&path).unwrap();
        assert!(flock.is_some());
    }

    #[tokio::test]
    async fn local_mutex_reports_locked() {
        let mutex = LocalMutex::new();
        let mut lock = mutex.acquire(&CancellationToken::new()).await.unwrap();
        assert!(mutex.is_locked());
        lock.release().unwrap();
        assert!(!mutex.is_locked());
    }
}
