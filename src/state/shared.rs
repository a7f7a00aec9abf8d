//! Snapshot shared between concurrently executing plan steps.
//!
//! Each logical name has its own entry lock; whole-snapshot persistence is
//! serialised behind the snapshot mutex so every write stores a complete,
//! consistent snapshot. When a lease is attached, every write renews it first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;

use super::lock::HeldLease;
use super::store::StateStore;
use super::types::StateSnapshot;

/// A snapshot that commits every change through a state store.
pub struct SharedSnapshot<'a> {
    store: &'a dyn StateStore,
    lease: Option<&'a HeldLease<'a>>,
    snapshot: Mutex<StateSnapshot>,
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<'a> SharedSnapshot<'a> {
    /// Wraps a loaded snapshot.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, snapshot: StateSnapshot) -> Self {
        Self {
            store,
            lease: None,
            snapshot: Mutex::new(snapshot),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Requires `lease` to be renewed before every write.
    #[must_use]
    pub fn with_lease(mut self, lease: Option<&'a HeldLease<'a>>) -> Self {
        self.lease = lease;
        self
    }

    /// Renews the attached lease, if any.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockContention` if another run took the lease.
    pub async fn renew_lease(&self) -> Result<()> {
        match self.lease {
            Some(lease) => lease.renew().await,
            None => Ok(()),
        }
    }

    /// Returns true if the attached lease was lost to another run.
    #[must_use]
    pub fn lease_lost(&self) -> bool {
        self.lease.is_some_and(HeldLease::is_lost)
    }

    /// Runs a read-only closure against the current snapshot.
    pub async fn read<R>(&self, f: impl FnOnce(&StateSnapshot) -> R) -> R {
        let snapshot = self.snapshot.lock().await;
        f(&snapshot)
    }

    /// Locks the entry of one logical name.
    pub async fn lock_entry(&self, name: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(name.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    /// Applies a change and persists the whole snapshot.
    ///
    /// If persisting fails the in-memory snapshot is restored, so memory
    /// never runs ahead of the store.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockContention` if the lease was lost, or the
    /// store error if the snapshot cannot be saved.
    pub async fn commit<R>(&self, f: impl FnOnce(&mut StateSnapshot) -> R) -> Result<R> {
        let mut snapshot = self.snapshot.lock().await;
        self.renew_lease().await?;
        let before = snapshot.clone();
        let result = f(&mut snapshot);
        if let Err(e) = self.store.save(&snapshot).await {
            *snapshot = before;
            return Err(e);
        }
        Ok(result)
    }

    /// Returns the final snapshot.
    pub fn into_inner(self) -> StateSnapshot {
        self.snapshot.into_inner()
    }
}

impl std::fmt::Debug for SharedSnapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSnapshot")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StackError, StateError};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_persists() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let shared = SharedSnapshot::new(&store, StateSnapshot::new("proj", "dev"));

        shared
            .commit(|s| s.description_hash = "abc".to_string())
            .await
            .unwrap();

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.description_hash, "abc");
        assert_eq!(shared.into_inner().description_hash, "abc");
    }

    #[tokio::test]
    async fn test_entry_locks_are_per_name() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let shared = SharedSnapshot::new(&store, StateSnapshot::new("proj", "dev"));

        let _a = shared.lock_entry("a").await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(50), shared.lock_entry("b")).await;
        assert!(b.is_ok());

        let a_again =
            tokio::time::timeout(std::time::Duration::from_millis(50), shared.lock_entry("a")).await;
        assert!(a_again.is_err());
    }

    #[tokio::test]
    async fn test_commit_refused_after_lease_lost() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let lock = store.acquire_lock("slow-run").await.unwrap();
        let lease = HeldLease::new(&store, lock).with_ttl(chrono::Duration::milliseconds(20));
        lease.renew().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let _other = store.acquire_lock("second-run").await.unwrap();

        let shared =
            SharedSnapshot::new(&store, StateSnapshot::new("proj", "dev")).with_lease(Some(&lease));
        let err = shared
            .commit(|s| s.description_hash = "stale".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, StackError::State(StateError::LockContention { .. })));
        assert!(shared.lease_lost());
        assert!(store.load().await.unwrap().is_none());
        assert!(shared.into_inner().description_hash.is_empty());
    }
}
