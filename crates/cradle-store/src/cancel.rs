use crate::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag handed to long-running operations.
///
/// Clones observe the same flag. A [`deferred`](Self::deferred) view records
/// requests but never reports them, so a phase that must not be interrupted
/// can run to completion while the caller still learns that cancellation
/// was asked for.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deferred: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one set by a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            deferred: false,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether work should stop now.
    pub fn is_cancelled(&self) -> bool {
        !self.deferred && self.flag.load(Ordering::SeqCst)
    }

    /// Whether cancellation was requested, even if currently deferred.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }

    pub fn deferred(&self) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deferred: true,
        }
    }
}
