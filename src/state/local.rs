//! Local file-based state storage backend.
//!
//! This module provides file-based state storage for single-machine use.
//! Writes go to a temporary file which is synced and then renamed over the
//! state file, so readers never observe a partial document.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{ApplyHistoryEntry, ObservedResource, STATE_VERSION, StateDocument};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Create attempts before giving up on a lock file that keeps changing.
const LOCK_ATTEMPTS: usize = 3;

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
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
            write_guard: Mutex::new(()),
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::io(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the state document, or an empty one if none exists yet.
    async fn read_document(&self) -> Result<StateDocument> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(StateDocument::new());
        }

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to read state file: {e}")))?;

        let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if document.version != STATE_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: document.version,
            }));
        }

        Ok(document)
    }

    /// Writes the state document atomically.
    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::io(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::io(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to rename state file: {e}")))?;

        debug!("State saved (serial {})", document.serial);
        Ok(())
    }

    /// Runs a read-modify-write cycle under the in-process guard.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StateDocument) -> Result<T> + Send,
    ) -> Result<T> {
        let _guard = self.write_guard.lock().await;
        let mut document = self.read_document().await?;
        let value = change(&mut document)?;
        self.write_document(&document).await?;
        Ok(value)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        read_lock_at(&self.lock_path).await
    }

    /// Writes a lock record to a private sibling of the lock file.
    async fn stage_lock_file(&self, lock_info: &LockInfo) -> Result<PathBuf> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let staged = self
            .lock_path
            .with_extension(format!("{}.tmp", lock_info.lock_id));

        let mut file = fs::File::create(&staged)
            .await
            .map_err(|e| lock_failed(format!("Failed to create lock file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(staged)
    }

    /// Publishes a lock record unless a lock file already exists.
    ///
    /// The record is hard-linked into place, so creation is atomic and
    /// readers never see a partial lock. Returns false when another holder
    /// got there first.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        let staged = self.stage_lock_file(lock_info).await?;
        let linked = fs::hard_link(&staged, &self.lock_path).await;
        remove_quietly(&staged).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(lock_failed(format!("Failed to create lock file: {e}"))),
        }
    }

    /// Moves an expired lock out of the way.
    ///
    /// Only one contender wins the rename. If the record moved aside turns
    /// out to be a fresh lock, it is linked back into place.
    async fn retire_expired(&self, expired: &LockInfo) -> Result<()> {
        let retired = self
            .lock_path
            .with_extension(format!("{}.expired", Uuid::new_v4().simple()));

        match fs::rename(&self.lock_path, &retired).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(lock_failed(format!("Failed to retire expired lock: {e}"))),
        }

        if let Ok(Some(moved)) = read_lock_at(&retired).await
            && moved.lock_id != expired.lock_id
        {
            debug!("Lock {} was renewed concurrently, restoring it", moved.lock_id);
            if let Err(e) = fs::hard_link(&retired, &self.lock_path).await {
                debug!("Lock {} not restored: {}", moved.lock_id, e);
            }
        }
        remove_quietly(&retired).await;
        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_failed(format!("Failed to delete lock file: {e}"))),
        }
    }
}

/// Reads a lock record; a missing file means no lock.
async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            }));
        }
    };

    let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
        ConvergeError::State(StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })
    })?;

    Ok(Some(lock_info))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), e);
    }
}

fn lock_failed(message: String) -> ConvergeError {
    ConvergeError::State(StateError::LockFailed { message })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, name: &str) -> Result<Option<ObservedResource>> {
        Ok(self.read_document().await?.resources.remove(name))
    }

    async fn put(&self, resource: ObservedResource) -> Result<()> {
        debug!("Recording {} as {}", resource.name, resource.provider_id);
        self.mutate(|doc| doc.insert_checked(resource).map_err(ConvergeError::from))
            .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        debug!("Removing {} from state", name);
        self.mutate(|doc| {
            doc.remove(name);
            Ok(())
        })
        .await
    }

    async fn all(&self) -> Result<BTreeMap<String, ObservedResource>> {
        Ok(self.read_document().await?.resources)
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::io(format!("Failed to delete state file: {e}")))?;
        }
        Ok(())
    }

    async fn history(&self) -> Result<Vec<ApplyHistoryEntry>> {
        Ok(self.read_document().await?.history)
    }

    async fn record_history(&self, entry: ApplyHistoryEntry) -> Result<()> {
        self.mutate(|doc| {
            doc.add_history(entry);
            Ok(())
        })
        .await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder);

        for _ in 0..LOCK_ATTEMPTS {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(ConvergeError::State(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                Some(existing) => {
                    debug!("Expired lock {} found, taking over", existing.lock_id);
                    self.retire_expired(&existing).await?;
                }
                None => debug!("Lock released while acquiring, retrying"),
            }
        }

        Err(lock_failed(String::from(
            "lock file kept changing while acquiring",
        )))
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => {}
            _ => {
                return Err(ConvergeError::State(StateError::LockLost {
                    lock_id: lock.lock_id.clone(),
                }));
            }
        }

        let renewed = lock.renewed();
        let staged = self.stage_lock_file(&renewed).await?;
        if let Err(e) = fs::rename(&staged, &self.lock_path).await {
            remove_quietly(&staged).await;
            return Err(lock_failed(format!("Failed to renew lock: {e}")));
        }

        debug!("Renewed state lock {}", renewed.lock_id);
        Ok(renewed)
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

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::state::ApplyOperation;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(name: &str, id: &str) -> ObservedResource {
        let attrs = [(String::from("cidr_block"), json!("10.0.0.0/16"))]
            .into_iter()
            .collect();
        ObservedResource::new(name, ResourceKind::Network, id, attrs, Vec::new())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_test_store();

        store.put(record("vpc1", "vpc-1")).await.expect("put failed");

        let loaded = store
            .get("vpc1")
            .await
            .expect("get failed")
            .expect("record should exist");
        assert_eq!(loaded.provider_id, "vpc-1");
        assert!(store.state_path().exists());
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (store, _temp) = create_test_store();

        assert!(store.get("vpc1").await.expect("get failed").is_none());
        assert!(store.all().await.expect("all failed").is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (store, _temp) = create_test_store();

        store.put(record("vpc1", "vpc-1")).await.expect("put failed");
        store.put(record("vpc2", "vpc-2")).await.expect("put failed");
        store.delete("vpc1").await.expect("delete failed");
        store.delete("missing").await.expect("delete of missing failed");

        let all = store.all().await.expect("all failed");
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["vpc2"]);

        store.clear().await.expect("clear failed");
        assert!(store.all().await.expect("all failed").is_empty());
    }

    #[tokio::test]
    async fn test_identifier_conflict_is_rejected() {
        let (store, _temp) = create_test_store();

        store.put(record("vpc1", "vpc-1")).await.expect("put failed");
        let err = store.put(record("vpc2", "vpc-1")).await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::State(StateError::IdentifierConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_puts_are_not_lost() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .put(record(&format!("vpc{i}"), &format!("vpc-{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked").expect("put failed");
        }

        assert_eq!(store.all().await.expect("all failed").len(), 8);
    }

    #[tokio::test]
    async fn test_history() {
        let (store, _temp) = create_test_store();

        store
            .record_history(ApplyHistoryEntry::new(
                ApplyOperation::Apply,
                "abc",
                vec![String::from("vpc1")],
                None,
            ))
            .await
            .expect("record failed");

        let history = store.history().await.expect("history failed");
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        std::fs::write(store.state_path(), "{ not json").expect("write failed");

        let err = store.all().await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
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
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let a = LocalStateStore::with_base_dir(temp.path());
        let b = LocalStateStore::with_base_dir(temp.path());

        for round in 0..50 {
            let (ra, rb) = tokio::join!(a.acquire_lock("a"), b.acquire_lock("b"));
            let won: Vec<&LockInfo> = [&ra, &rb].into_iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(won.len(), 1, "round {round}: {ra:?} / {rb:?}");
            for result in [&ra, &rb] {
                if let Err(e) = result {
                    assert!(matches!(e, ConvergeError::State(StateError::LockedByOther { .. })));
                }
            }
            a.release_lock(&won[0].lock_id).await.expect("release failed");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_of_expired_lock() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let a = LocalStateStore::with_base_dir(temp.path());
        let b = LocalStateStore::with_base_dir(temp.path());

        for _ in 0..20 {
            let mut stale = LockInfo::new("crashed");
            stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
            std::fs::write(temp.path().join(LOCK_FILE), serde_json::to_string(&stale).unwrap())
                .unwrap();

            let (ra, rb) = tokio::join!(a.acquire_lock("a"), b.acquire_lock("b"));
            let won: Vec<LockInfo> = [ra, rb].into_iter().filter_map(Result::ok).collect();
            assert_eq!(won.len(), 1);
            let current = a.get_lock_info().await.unwrap().unwrap();
            assert_eq!(current.lock_id, won[0].lock_id);
            a.release_lock(&current.lock_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();
        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(temp.path().join(LOCK_FILE), serde_json::to_string(&stale).unwrap())
            .unwrap();

        let lock = store.acquire_lock("next").await.unwrap();
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().holder, "next");
        assert_ne!(lock.lock_id, stale.lock_id);
    }

    #[tokio::test]
    async fn test_renew_extends_held_lock() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.unwrap();

        let renewed = store.renew_lock(&lock).await.unwrap();
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(renewed.expires_at >= lock.expires_at);
        assert_eq!(store.get_lock_info().await.unwrap(), Some(renewed));
    }

    #[tokio::test]
    async fn test_renew_fails_once_lock_is_gone() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.unwrap();
        store.release_lock(&lock.lock_id).await.unwrap();

        let err = store.renew_lock(&lock).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
    }
}
