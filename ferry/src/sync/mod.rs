//! Mutual exclusion for code running across contexts.
//!
//! Two families share one contract:
//! - `Local*` primitives coordinate tasks and threads of one process, on top of
//!   tokio's fair semaphore
//! - `File*` primitives coordinate separate processes through `flock(2)` on
//!   lock files both sides can name
//!
//! Every acquire returns a [`Lock`] and takes a cancellation token that aborts
//! only the local wait.

mod lock;
mod mutex;
mod parcel;
mod semaphore;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use lock::{Lock, LockError};
#[cfg(unix)]
pub use mutex::FileMutex;
pub use mutex::LocalMutex;
#[cfg(unix)]
pub use parcel::FileParcel;
pub use parcel::{LocalParcel, Parcel};
#[cfg(unix)]
pub use semaphore::FileSemaphore;
pub use semaphore::LocalSemaphore;

use crate::bridge::SerializationError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("acquire cancelled")]
    Cancelled,
    #[error("the primitive was closed")]
    Closed,
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Single-holder lock.
#[async_trait]
pub trait Mutex: Send + Sync {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError>;
}

/// Counting lock with a fixed number of slots.
#[async_trait]
pub trait Semaphore: Send + Sync {
    /// Total number of slots.
    fn size(&self) -> usize;

    async fn acquire(&self, cancel: &CancellationToken) -> Result<Lock, SyncError>;
}
