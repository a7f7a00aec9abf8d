//! Run-level lease on the state store.
//!
//! Only one run may mutate a snapshot at a time. A run acquires the lease
//! before loading state, polls for a bounded time when another run holds it,
//! renews it while the run is in progress, and releases it when the run ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StackError, StateError};

use super::store::StateStore;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Returns a copy of this lock expiring `ttl` from now.
    #[must_use]
    pub fn extended(&self, ttl: chrono::Duration) -> Self {
        Self {
            expires_at: Utc::now() + ttl,
            ..self.clone()
        }
    }

    /// Builds the contention error reported when this lock blocks another run.
    #[must_use]
    pub fn contention(&self, waited: Duration) -> StateError {
        StateError::LockContention {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
            waited_secs: waited.as_secs(),
        }
    }
}

/// Error for a run whose lock is gone or held under another identifier.
pub(crate) fn lease_lost(current: Option<&LockInfo>) -> StackError {
    StateError::LockContention {
        holder: current.map_or_else(|| String::from("nobody"), |l| l.holder.clone()),
        since: current.map_or_else(|| Utc::now().to_rfc3339(), |l| l.acquired_at.to_rfc3339()),
        waited_secs: 0,
    }
    .into()
}

/// Bounded wait settings for lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    /// Total time to keep trying.
    pub max_wait: Duration,
    /// Delay between attempts.
    pub poll_interval: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Acquires the run-level lease, polling while another run holds it.
///
/// # Errors
///
/// Returns `StateError::LockContention` if the lease is still held when the
/// bounded wait elapses, or any other store error immediately.
pub async fn acquire_lease(
    store: &dyn StateStore,
    holder: &str,
    options: LeaseOptions,
) -> Result<LockInfo> {
    let started = Instant::now();
    let deadline = started + options.max_wait;

    loop {
        match store.acquire_lock(holder).await {
            Ok(lock) => return Ok(lock),
            Err(StackError::State(StateError::LockContention { holder: other, since, .. })) => {
                let now = Instant::now();
                if now >= deadline {
                    info!("Gave up waiting for state lock held by {other}");
                    return Err(StateError::LockContention {
                        holder: other,
                        since,
                        waited_secs: now.duration_since(started).as_secs(),
                    }
                    .into());
                }
                debug!("State lock held by {other}, retrying");
                let pause = options.poll_interval.min(deadline - now);
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A lease held by the current run.
///
/// Every snapshot write renews the lease first, so a run that lost it to
/// another run fails instead of overwriting that run's state.
pub struct HeldLease<'a> {
    store: &'a dyn StateStore,
    lock: Mutex<LockInfo>,
    ttl: chrono::Duration,
    lost: AtomicBool,
}

impl<'a> HeldLease<'a> {
    /// Wraps a freshly acquired lock.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, lock: LockInfo) -> Self {
        Self {
            store,
            lock: Mutex::new(lock),
            ttl: chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            lost: AtomicBool::new(false),
        }
    }

    /// Sets how far each renewal pushes the expiry.
    #[must_use]
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the lock identifier.
    pub async fn lock_id(&self) -> String {
        self.lock.lock().await.lock_id.clone()
    }

    /// Returns true once a renewal found the lock taken or gone.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Confirms the lock is still ours and extends its expiry.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockContention` if another run took the lock,
    /// or the store error if the lock could not be rewritten.
    pub async fn renew(&self) -> Result<()> {
        let mut lock = self.lock.lock().await;
        let next = lock.extended(self.ttl);
        match self.store.renew_lock(&next).await {
            Ok(()) => {
                *lock = next;
                Ok(())
            }
            Err(e) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Renews the lease every third of its lifetime.
    ///
    /// Only returns once a renewal fails; run it alongside the work it
    /// protects.
    pub async fn keep_alive(&self) {
        let interval = (self.ttl / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.renew().await {
                warn!("State lease lost: {e}");
                return;
            }
            debug!("Renewed state lease");
        }
    }

    /// Releases the lock if it is still ours.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lock cannot be removed.
    pub async fn release(&self) -> Result<()> {
        let lock_id = self.lock_id().await;
        self.store.release_lock(&lock_id).await
    }
}

impl std::fmt::Debug for HeldLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLease")
            .field("backend", &self.store.backend_type())
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_lease_contention_after_bounded_wait() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let _held = acquire_lease(&store, "first-run", LeaseOptions::default())
            .await
            .unwrap();

        let options = LeaseOptions {
            max_wait: Duration::from_millis(120),
            poll_interval: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let err = acquire_lease(&store, "second-run", options).await.unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(120));
        match err {
            StackError::State(StateError::LockContention { holder, .. }) => {
                assert_eq!(holder, "first-run");
            }
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lease_acquired_once_released() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let held = acquire_lease(&store, "first-run", LeaseOptions::default())
            .await
            .unwrap();
        store.release_lock(&held.lock_id).await.unwrap();

        let next = acquire_lease(&store, "second-run", LeaseOptions::default())
            .await
            .unwrap();
        assert_eq!(next.holder, "second-run");
    }

    #[tokio::test]
    async fn test_renewal_keeps_other_runs_out() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let lock = store.acquire_lock("long-run").await.unwrap();
        let lease = HeldLease::new(&store, lock).with_ttl(chrono::Duration::milliseconds(300));
        lease.renew().await.unwrap();

        tokio::select! {
            () = lease.keep_alive() => panic!("renewal failed"),
            () = tokio::time::sleep(Duration::from_millis(700)) => {}
        }

        let err = store.acquire_lock("second-run").await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::LockContention { .. })));
        lease.renew().await.unwrap();
        assert!(!lease.is_lost());
    }

    #[tokio::test]
    async fn test_expired_lease_is_lost_after_takeover() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let lock = store.acquire_lock("slow-run").await.unwrap();
        let lease = HeldLease::new(&store, lock).with_ttl(chrono::Duration::milliseconds(20));
        lease.renew().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let other = store.acquire_lock("second-run").await.unwrap();

        let err = lease.renew().await.unwrap_err();
        match err {
            StackError::State(StateError::LockContention { holder, .. }) => {
                assert_eq!(holder, "second-run");
            }
            other => panic!("expected contention, got {other:?}"),
        }
        assert!(lease.is_lost());

        // Releasing a lost lease leaves the new holder alone.
        lease.release().await.unwrap();
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, other.lock_id);
    }
}
