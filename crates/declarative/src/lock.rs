//! Per-instance mutual exclusion
//!
//! Two runs sharing an [`IdLocks`] never invoke lifecycle functions for the
//! same `(scope, id)` at the same time. Locks are only held for the duration
//! of one invocation plus its state write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (String, String);

/// Shared table of per-instance locks
#[derive(Debug, Clone, Default)]
pub struct IdLocks {
    inner: Arc<Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>>,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `(scope, id)` is free and hold it until the guard drops
    pub async fn acquire(&self, scope: &str, id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop slots nobody holds or waits on
            table.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(
                table
                    .entry((scope.to_string(), id.to_string()))
                    .or_default(),
            )
        };
        slot.lock_owned().await
    }

    /// Number of ids currently tracked
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
