//! Exclusivity flags for backup and upload runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An at-most-one flag, acquired only through compare-and-set
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    held: Arc<AtomicBool>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if nobody holds it. Released when the guard drops.
    pub fn try_acquire(&self) -> Option<LockGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof of holding an [`OperationLock`]
#[derive(Debug)]
pub struct LockGuard {
    held: Arc<AtomicBool>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
