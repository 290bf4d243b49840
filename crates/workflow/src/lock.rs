//! Per-record mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::record::RecordKey;

/// One async mutex per record key. Tokio mutexes queue waiters in FIFO
/// order, so events for one record run in arrival order.
#[derive(Debug, Clone, Default)]
pub struct IssueLocks {
    locks: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
}

/// Held while a handler runs for a record.
#[derive(Debug)]
pub struct IssueGuard {
    key: RecordKey,
    _guard: OwnedMutexGuard<()>,
}

impl IssueGuard {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

impl IssueLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &RecordKey) -> IssueGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        IssueGuard {
            key: key.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
