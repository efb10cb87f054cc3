//! Local file-based state storage backend.
//!
//! State lives in a directory on the deployment host, next to the checkout.
//! The state file is replaced atomically and the lock file is created with
//! `create_new`, so two processes can never both believe they hold it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StackshiftError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::DeploymentState;

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "deploy.lock";

/// How long an empty lock file is assumed to be mid-write.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(30);

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
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
        }
    }

    /// Gets the state directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackshiftError::State(StateError::WriteFailed {
                    message: format!("Failed to create state directory: {e}"),
                })
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StackshiftError::State(StateError::LockFailed {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackshiftError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file {}: {e}", self.lock_path.display()),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Returns the age of the lock file if it exists but holds nothing.
    ///
    /// An acquirer that died between creating and writing the file leaves an
    /// empty one behind.
    async fn empty_lock_age(&self) -> Option<Duration> {
        let content = fs::read_to_string(&self.lock_path).await.ok()?;
        if !content.trim().is_empty() {
            return None;
        }

        let age = fs::metadata(&self.lock_path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or(Duration::MAX);
        Some(age)
    }

    /// Creates the lock file, failing if it already exists.
    ///
    /// Returns `Ok(false)` if another lock file is in place.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StateError::serialization(format!("Failed to serialize lock: {e}"))
        })?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StackshiftError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackshiftError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            StackshiftError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(true)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<bool> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StackshiftError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StackshiftError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: DeploymentState = serde_json::from_str(&content).map_err(|e| {
            StackshiftError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        self.ensure_dir().await?;

        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            StateError::serialization(format!("Failed to serialize state: {e}"))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StackshiftError::State(StateError::WriteFailed {
                message: format!("Failed to create temp state file: {e}"),
            })
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackshiftError::State(StateError::WriteFailed {
                message: format!("Failed to write state file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            StackshiftError::State(StateError::WriteFailed {
                message: format!("Failed to sync state file: {e}"),
            })
        })?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            StackshiftError::State(StateError::WriteFailed {
                message: format!("Failed to rename state file: {e}"),
            })
        })?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        // One retry covers taking over an expired lock.
        for _ in 0..2 {
            let lock_info = LockInfo::new(&holder_id);
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired deployment lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.empty_lock_age().await {
                Some(age) if age >= EMPTY_LOCK_GRACE => {
                    warn!("Removing empty lock file left by an interrupted acquisition");
                    self.delete_lock_file().await?;
                    continue;
                }
                Some(_) => {
                    return Err(StackshiftError::State(StateError::LockFailed {
                        message: String::from(
                            "Lock file is being written by another deployment",
                        ),
                    }));
                }
                None => {}
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StackshiftError::State(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                Some(existing) => {
                    warn!(
                        "Taking over expired lock held by {} since {}",
                        existing.holder, existing.acquired_at
                    );
                    self.delete_lock_file().await?;
                }
                None => debug!("Lock file vanished, retrying"),
            }
        }

        Err(StackshiftError::State(StateError::LockFailed {
            message: String::from("Lock file keeps reappearing; another deployment is starting"),
        }))
    }

    async fn release_lock(&self, lock_id: &str) -> Result<bool> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                info!("Released deployment lock: {lock_id}");
                Ok(true)
            }
            Some(existing) => {
                warn!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn force_release_lock(&self) -> Result<bool> {
        let removed = self.delete_lock_file().await?;
        if removed {
            warn!("Deployment lock removed by force");
        }
        Ok(removed)
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
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(".stackshift"));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("shop", "prod");
        state.last_deployed_revision = Some(String::from("abc123"));
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "shop");
        assert_eq!(loaded.last_deployed_revision.as_deref(), Some("abc123"));
        assert!(!store.base_dir().join("state.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.base_dir()).unwrap();
        std::fs::write(store.base_dir().join(STATE_FILE), "{ not json").unwrap();

        let result = store.load().await;
        assert!(matches!(
            result,
            Err(StackshiftError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("ci-runner")
            .await
            .expect("Failed to acquire lock");

        assert!(store.get_lock_info().await.unwrap().is_some());
        assert!(!store.release_lock("someone-else").await.unwrap());
        assert!(store.release_lock(&lock.lock_id).await.unwrap());
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
            Err(StackshiftError::State(StateError::LockedByOther { holder, .. })) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.base_dir()).unwrap();

        let mut stale = LockInfo::new("crashed-runner");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        std::fs::write(
            store.base_dir().join(LOCK_FILE),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = store.acquire_lock("ci-runner").await.unwrap();
        assert_eq!(lock.holder, "ci-runner");
        assert_ne!(lock.lock_id, stale.lock_id);
    }

    #[tokio::test]
    async fn test_abandoned_empty_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.base_dir()).unwrap();
        let lock_path = store.base_dir().join(LOCK_FILE);
        let file = std::fs::File::create(&lock_path).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        drop(file);

        let lock = store.acquire_lock("ci-runner").await.unwrap();
        assert_eq!(lock.holder, "ci-runner");
        assert_eq!(store.get_lock_info().await.unwrap(), Some(lock));
    }

    #[tokio::test]
    async fn test_fresh_empty_lock_is_not_taken_over() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.base_dir()).unwrap();
        std::fs::write(store.base_dir().join(LOCK_FILE), "").unwrap();

        let result = store.acquire_lock("ci-runner").await;
        assert!(matches!(
            result,
            Err(StackshiftError::State(StateError::LockFailed { .. }))
        ));
        assert!(store.base_dir().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_force_release() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("").await.unwrap();
        assert!(store.force_release_lock().await.unwrap());
        assert!(!store.force_release_lock().await.unwrap());
    }
}
