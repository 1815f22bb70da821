//! Parcels: a shared value guarded by a mutex.

use std::sync::{Arc, Mutex as StdMutex};
#[cfg(unix)]
use std::{marker::PhantomData, path::PathBuf};

use async_trait::async_trait;
#[cfg(unix)]
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use super::FileMutex;
use super::{LocalMutex, Lock, Mutex, SyncError};
#[cfg(unix)]
use crate::bridge::SerializationError;

/// A value shared under a lock.
///
/// `load` and `store` do not lock on their own; compose them under
/// [`lock`](Self::lock), or use [`synchronized`](Self::synchronized).
#[async_trait]
pub trait Parcel: Send + Sync {
    type Value: Send + 'static;

    async fn lock(&self, cancel: &CancellationToken) -> Result<Lock, SyncError>;

    async fn load(&self) -> Result<Self::Value, SyncError>;

    async fn store(&self, value: Self::Value) -> Result<(), SyncError>;

    /// Read the value under the lock.
    async fn get(&self, cancel: &CancellationToken) -> Result<Self::Value, SyncError> {
        let mut lock = self.lock(cancel).await?;
        let value = self.load().await;
        lock.release()?;
        value
    }

    /// Replace the value under the lock.
    async fn set(&self, value: Self::Value, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut lock = self.lock(cancel).await?;
        let stored = self.store(value).await;
        lock.release()?;
        stored
    }

    /// Lock, hand the value to `f`, store whatever `f` left in it, unlock.
    ///
    /// If `f` fails nothing is stored. The lock is released on every path,
    /// including a panic in `f`.
    async fn synchronized<F, R, E>(&self, cancel: &CancellationToken, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Self::Value) -> Result<R, E> + Send,
        R: Send,
        E: From<SyncError> + Send,
    {
        let mut lock = self.lock(cancel).await?;
        let result = match self.load().await {
            Ok(mut value) => match f(&mut value) {
                Ok(out) => self.store(value).await.map(|()| out).map_err(E::from),
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };
        lock.release().map_err(SyncError::from)?;
        result
    }
}

/// In-process parcel.
#[derive(Debug)]
pub struct LocalParcel<T> {
    mutex: LocalMutex,
    value: Arc<StdMutex<T>>,
}

impl<T> Clone for LocalParcel<T> {
    fn clone(&self) -> Self {
        Self {
            mutex: self.mutex.clone(),
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: Clone + Send + 'static> LocalParcel<T> {
    pub fn new(value: T) -> Self {
        Self {
            mutex: LocalMutex::new(),
            value: Arc::new(StdMutex::new(value)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Parcel for LocalParcel<T> {
    type Value = T;

    async fn lock(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        self.mutex.acquire(cancel).await
    }

    async fn load(&self) -> Result<T, SyncError> {
        Ok(self.slot().clone())
    }

    async fn store(&self, value: T) -> Result<(), SyncError> {
        *self.slot() = value;
        Ok(())
    }
}

/// Cross-process parcel: a JSON document at `path`, guarded by a
/// [`FileMutex`] on `<path>.lock`.
///
/// Stores write a sibling temporary file and rename it over `path`, so an
/// unlocked reader sees either the old or the new value.
#[cfg(unix)]
#[derive(Debug)]
pub struct FileParcel<T> {
    path: PathBuf,
    mutex: FileMutex,
    _value: PhantomData<fn() -> T>,
}

#[cfg(unix)]
impl<T> Clone for FileParcel<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            mutex: self.mutex.clone(),
            _value: PhantomData,
        }
    }
}

#[cfg(unix)]
fn sibling(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
impl<T> FileParcel<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Attach to a parcel another party created.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            mutex: FileMutex::new(sibling(&path, ".lock")),
            path,
            _value: PhantomData,
        }
    }

    /// Attach to the parcel at `path`, writing `initial` if it does not exist yet.
    pub async fn create(path: impl Into<PathBuf>, initial: T) -> Result<Self, SyncError> {
        let parcel = Self::open(path);
        let mut lock = parcel.lock(&CancellationToken::new()).await?;
        let exists = tokio::fs::try_exists(&parcel.path)
            .await
            .map_err(|e| SyncError::io(&parcel.path, e));
        let created = match exists {
            Ok(false) => parcel.store(initial).await,
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        };
        lock.release()?;
        created.map(|()| parcel)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl<T> Parcel for FileParcel<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    async fn lock(&self, cancel: &CancellationToken) -> Result<Lock, SyncError> {
        self.mutex.acquire(cancel).await
    }

    async fn load(&self) -> Result<T, SyncError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SyncError::io(&self.path, e))?;
        Ok(serde_json::from_slice(&bytes).map_err(SerializationError::from)?)
    }

    async fn store(&self, value: T) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec(&value).map_err(SerializationError::from)?;
        let staging = sibling(&self.path, ".tmp");
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| SyncError::io(&staging, e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| SyncError::io(&self.path, e))
    }
}
