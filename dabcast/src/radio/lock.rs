//! Exclusion token over the receiver.
//!
//! The receiver can only be tuned by one owner at a time. The lock is a
//! single-permit semaphore; holding a [`DeviceLockGuard`] means owning the
//! receiver, dropping it hands the receiver back.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Lock-related errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The receiver is already owned.
    #[error("Receiver lock is held")]
    AcquireFailed,

    /// The lock was closed (receiver shut down).
    #[error("Receiver lock closed")]
    Closed,
}

/// Binary lock over one receiver.
#[derive(Debug)]
pub struct DeviceLock {
    semaphore: Arc<Semaphore>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Result<DeviceLockGuard, LockError> {
        use tokio::sync::TryAcquireError;

        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => LockError::Closed,
                TryAcquireError::NoPermits => LockError::AcquireFailed,
            })?;
        Ok(DeviceLockGuard { _permit: permit })
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Refuse all further acquisitions. Existing guards stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for DeviceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of the receiver. Released on drop.
#[derive(Debug)]
pub struct DeviceLockGuard {
    _permit: OwnedSemaphorePermit,
}
