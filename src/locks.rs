//! Advisory Locks
//! Mission: Serialize wallet mutations per user without any cross-user ordering

use crate::errors::{CoreError, CoreResult};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub const LOCK_WAIT: Duration = Duration::from_secs(5);

/// In-process advisory locks keyed by id (user or challenge). A lock entry is
/// created on first use and kept for the registry's lifetime; contention on
/// the outer map is a short critical section only.
#[derive(Clone)]
pub struct LockRegistry {
    entries: Arc<SyncMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
    wait: Duration,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::with_wait(LOCK_WAIT)
    }

    pub fn with_wait(wait: Duration) -> Self {
        Self {
            entries: Arc::new(SyncMutex::new(HashMap::new())),
            wait,
        }
    }

    fn entry(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.entries.lock();
        map.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Take the exclusive lock for `id`, failing with `WalletBusy` after the
    /// wait timeout. The guard releases on drop (transaction commit/rollback).
    pub async fn acquire(&self, id: Uuid) -> CoreResult<OwnedMutexGuard<()>> {
        let entry = self.entry(id);
        tokio::time::timeout(self.wait, entry.lock_owned())
            .await
            .map_err(|_| CoreError::WalletBusy)
    }

    /// Take several locks at once, always in ascending id order so concurrent
    /// multi-lock holders cannot deadlock each other. Duplicates are collapsed.
    pub async fn acquire_many(&self, ids: &[Uuid]) -> CoreResult<Vec<OwnedMutexGuard<()>>> {
        let mut sorted: Vec<Uuid> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.acquire(id).await?);
        }
        Ok(guards)
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = LockRegistry::with_wait(Duration::from_millis(50));
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await.unwrap();
        match locks.acquire(id).await {
            Err(CoreError::WalletBusy) => {}
            other => panic!("expected WalletBusy, got {other:?}"),
        }
        drop(guard);
        assert!(locks.acquire(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_ids_do_not_contend() {
        let locks = LockRegistry::with_wait(Duration::from_millis(50));
        let _a = locks.acquire(Uuid::new_v4()).await.unwrap();
        let _b = locks.acquire(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_many_collapses_duplicates() {
        let locks = LockRegistry::with_wait(Duration::from_millis(50));
        let id = Uuid::new_v4();
        let guards = locks.acquire_many(&[id, id, id]).await.unwrap();
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_many_orders_ascending() {
        // Two tasks locking overlapping sets must not deadlock because both
        // acquire in sorted order. Run a few rounds to give interleaving a chance.
        let locks = LockRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for _ in 0..16 {
            let l1 = locks.clone();
            let l2 = locks.clone();
            let t1 = tokio::spawn(async move { l1.acquire_many(&[a, b]).await.map(|_| ()) });
            let t2 = tokio::spawn(async move { l2.acquire_many(&[b, a]).await.map(|_| ()) });
            t1.await.unwrap().unwrap();
            t2.await.unwrap().unwrap();
        }
    }
}
