//! Local file-based state storage backend.
//!
//! This module provides file-based state storage for local development and
//! single-machine use. The snapshot is replaced atomically by writing a
//! temporary file and renaming it over the previous one.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, lease_lost};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

fn io_error(message: &str, e: &std::io::Error) -> StackError {
    StackError::State(StateError::LockFailed {
        message: format!("{message}: {e}"),
    })
}

async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StackError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            }));
        }
    };

    let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
        StackError::State(StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })
    })?;

    Ok(Some(lock_info))
}

impl LocalStateStore {
    /// Creates a new local state store under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        read_lock_at(&self.lock_path).await
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_error("Failed to create lock file", &e)),
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_error("Failed to write lock file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("Failed to sync lock file", &e))?;

        Ok(true)
    }

    /// Rewrites the lock file in place through a temporary file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let temp_path = self
            .base_dir
            .join(format!("{LOCK_FILE}.{}.tmp", lock_info.lock_id));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error("Failed to write lock file", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_error("Failed to write lock file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("Failed to sync lock file", &e))?;
        drop(file);

        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| io_error("Failed to replace lock file", &e))
    }

    /// Moves an expired lock out of the way.
    ///
    /// The lock file is renamed aside and checked: if it is no longer the
    /// expired lock `stale_id`, another run replaced it in the meantime and
    /// it is put back. Returns false in that case.
    async fn retire_lock_file(&self, stale_id: &str, taker_id: &str) -> Result<bool> {
        let aside = self.base_dir.join(format!("{LOCK_FILE}.{taker_id}"));
        match fs::rename(&self.lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(io_error("Failed to retire lock file", &e)),
        }

        let moved = read_lock_at(&aside).await;
        let retired = matches!(&moved, Ok(Some(lock)) if lock.lock_id == stale_id);
        if !retired {
            debug!("Lock changed hands during takeover, restoring it");
            match fs::hard_link(&aside, &self.lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_error("Failed to restore lock file", &e)),
            }
        }

        match fs::remove_file(&aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("Failed to remove retired lock file", &e)),
        }
        Ok(retired)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("Failed to delete lock file", &e)),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StackError::State(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }));
            }
        };

        debug!("Loaded state from: {}", self.state_path.display());

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self
            .state_path
            .with_extension(format!("{}.tmp", snapshot.serial));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.state_path).await?;

        debug!(
            "State saved to {} (serial {})",
            self.state_path.display(),
            snapshot.serial
        );
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        if self.create_lock_file(&lock_info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                lock_info.lock_id, LOCK_EXPIRY_SECS
            );
            return Ok(lock_info);
        }

        match self.read_lock_file().await? {
            Some(existing) if !existing.is_expired() => {
                return Err(existing.contention(std::time::Duration::ZERO).into());
            }
            Some(stale) => {
                debug!("Stale lock {} found, taking over", stale.lock_id);
                if !self.retire_lock_file(&stale.lock_id, &lock_info.lock_id).await? {
                    return Err(lease_lost(self.read_lock_file().await?.as_ref()));
                }
            }
            None => debug!("Lock vanished before it could be read"),
        }

        if self.create_lock_file(&lock_info).await? {
            info!("Acquired state lock: {}", lock_info.lock_id);
            return Ok(lock_info);
        }
        Err(lease_lost(self.read_lock_file().await?.as_ref()))
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<()> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => self.write_lock_file(lock).await,
            current => Err(lease_lost(current.as_ref())),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let snapshot = StateSnapshot::new("test-project", "dev");
        store.save(&snapshot).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_without_leftovers() {
        let (store, temp) = create_test_store();

        let mut snapshot = StateSnapshot::new("test-project", "dev");
        store.save(&snapshot).await.unwrap();
        snapshot.touch();
        snapshot.description_hash = "second".to_string();
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.description_hash, "second");

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![STATE_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join(STATE_FILE), "{ not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.get_lock_info().await.unwrap().is_some());

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(StackError::State(StateError::LockContention { .. }))
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (store, temp) = create_test_store();

        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(
            temp.path().join(LOCK_FILE),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = store.acquire_lock("new-run").await.unwrap();
        assert_eq!(lock.holder, "new-run");
    }

    #[tokio::test]
    async fn test_takeover_restores_a_lock_that_changed_hands() {
        let (store, temp) = create_test_store();

        // Another run replaced the expired lock after it was read.
        let fresh = store.acquire_lock("fresh-run").await.unwrap();
        let retired = store.retire_lock_file("expired-lock", "late-run").await.unwrap();
        assert!(!retired);

        let current = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(current.lock_id, fresh.lock_id);

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![LOCK_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_renew_extends_only_the_held_lock() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("holder-1").await.unwrap();
        let extended = lock.extended(chrono::Duration::seconds(600));
        store.renew_lock(&extended).await.unwrap();
        assert_eq!(
            store.get_lock_info().await.unwrap().unwrap().expires_at,
            extended.expires_at
        );

        let foreign = LockInfo::new("holder-2");
        let err = store.renew_lock(&foreign).await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::LockContention { .. })));

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.renew_lock(&extended).await.is_err());
    }
}
