//! Per-partition mutual exclusion.
//!
//! Appends to one partition queue behind each other. Incremental verification of a
//! partition never queues: a second attempt while one is running is refused so a short
//! schedule cannot pile up behind a slow run. Cursor resets do queue on the same lock,
//! so an in-flight incremental run cannot re-save a cursor after it was dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held for the duration of a partition's critical section.
pub struct PartitionGuard {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Clone, Default)]
pub struct ConcurrencyGuard {
    append_locks: Arc<LockTable>,
    verify_locks: Arc<LockTable>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive append access to `partition_key`.
    pub async fn lock_append(&self, partition_key: &str) -> PartitionGuard {
        let lock = Self::lock_for(&self.append_locks, partition_key);
        PartitionGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Wait for the verify lock of `partition_key`.
    pub async fn lock_verify(&self, partition_key: &str) -> PartitionGuard {
        let lock = Self::lock_for(&self.verify_locks, partition_key);
        PartitionGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Take the incremental-verify lock for `partition_key` without waiting.
    pub fn try_lock_verify(&self, partition_key: &str) -> LedgerResult<PartitionGuard> {
        let lock = Self::lock_for(&self.verify_locks, partition_key);
        match lock.try_lock_owned() {
            Ok(guard) => Ok(PartitionGuard { _guard: guard }),
            Err(_) => {
                debug!(partition = partition_key, "Incremental verification lock busy");
                Err(LedgerError::verification_in_progress(partition_key))
            }
        }
    }

    fn lock_for(locks: &LockTable, partition_key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = table(locks);
        // Drop entries nobody holds or waits on; the table only grows with live partitions.
        table.retain(|key, lock| key == partition_key || Arc::strong_count(lock) > 1);
        table
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn table(locks: &LockTable) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracked_partitions(guard: &ConcurrencyGuard) -> usize {
        table(&guard.append_locks).len() + table(&guard.verify_locks).len()
    }

    #[tokio::test]
    async fn test_verify_lock_is_try_only() {
        let guard = ConcurrencyGuard::new();
        let held = guard.try_lock_verify("user-A").unwrap();

        let second = guard.try_lock_verify("user-A");
        assert!(matches!(second, Err(LedgerError::ConcurrencyConflict(_))));

        // Other partitions are unaffected.
        assert!(guard.try_lock_verify("user-B").is_ok());

        drop(held);
        assert!(guard.try_lock_verify("user-A").is_ok());
    }

    #[tokio::test]
    async fn test_append_lock_serializes_same_partition() {
        let guard = ConcurrencyGuard::new();
        let held = guard.lock_append("user-A").await;

        let contender = guard.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.lock_append("user-A").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second appender must wait");

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_append_lock_does_not_block_other_partitions() {
        let guard = ConcurrencyGuard::new();
        let _a = guard.lock_append("user-A").await;
        let b = tokio::time::timeout(Duration::from_millis(200), guard.lock_append("user-B")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_dropped() {
        let guard = ConcurrencyGuard::new();
        for i in 0..10 {
            let _g = guard.lock_append(&format!("p-{}", i)).await;
        }
        let _held = guard.lock_append("last").await;
        assert_eq!(tracked_partitions(&guard), 1);
    }

    #[tokio::test]
    async fn test_lock_verify_waits_for_running_verification() {
        let guard = ConcurrencyGuard::new();
        let running = guard.try_lock_verify("user-A").unwrap();

        let contender = guard.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.lock_verify("user-A").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "reset must wait for the running verification");

        drop(running);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(guard.try_lock_verify("user-A").is_ok());
    }
}
