//! Scoped lock handle returned by every acquire.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("the lock has already been released")]
    AlreadyReleased,
}

type Release = Box<dyn FnOnce() + Send>;

/// Proof of holding a mutex or semaphore slot.
///
/// Release it explicitly with [`release`](Self::release). A lock dropped while
/// still held is released on drop.
#[must_use = "dropping a Lock releases it immediately"]
pub struct Lock {
    label: &'static str,
    release: Option<Release>,
}

impl Lock {
    pub(crate) fn new(label: &'static str, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            release: Some(Box::new(release)),
        }
    }

    pub fn release(&mut self) -> Result<(), LockError> {
        let release = self.release.take().ok_or(LockError::AlreadyReleased)?;
        release();
        tracing::trace!(lock = self.label, "Lock released");
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::warn!(lock = self.label, "Lock dropped without release");
            release();
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("label", &self.label)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Lock, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lock = Lock::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (lock, calls)
    }

    #[test]
    fn second_release_is_an_error() {
        let (mut lock, calls) = counting();
        assert!(!lock.is_released());
        lock.release().unwrap();
        assert!(lock.is_released());
        assert_eq!(lock.release(), Err(LockError::AlreadyReleased));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_once() {
        let (lock, calls) = counting();
        drop(lock);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (mut lock, calls) = counting();
        lock.release().unwrap();
        drop(lock);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
