//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::types::StateSnapshot;
use super::lock::LockInfo;

/// Trait for state storage backends.
///
/// `save` replaces the whole snapshot atomically: readers observe either the
/// previous snapshot or the new one, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state snapshot.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the state snapshot.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Tries once to acquire the lock on the state.
    ///
    /// Fails with `StateError::LockContention` if a live lock is held.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Replaces the held lock with `lock`, typically to extend its expiry.
    ///
    /// Fails with `StateError::LockContention` if the stored lock is gone or
    /// carries another `lock_id`.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<()>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<()> {
        (**self).renew_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
