//! Local file-based state storage backend.
//!
//! Snapshots are written to `.stackplan/state.json` through a temporary file
//! and a rename, so a crash mid-write never leaves a truncated snapshot.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{STATE_VERSION, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackplan";

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

impl LocalStateStore {
    /// Creates a new local state store in `./.stackplan`.
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

    /// Gets the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StackError::State(StateError::write(format!(
                "Failed to create {}: {e}",
                temp_path.display()
            )))
        })?;

        file.write_all(content).await.map_err(|e| {
            StackError::State(StateError::write(format!(
                "Failed to write {}: {e}",
                temp_path.display()
            )))
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::write(format!(
                "Failed to sync {}: {e}",
                temp_path.display()
            )))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StackError::State(StateError::write(format!(
                "Failed to rename {}: {e}",
                temp_path.display()
            )))
        })?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

/// Rejects snapshots written by an incompatible format version.
pub(super) fn check_version(snapshot: &StateSnapshot) -> Result<()> {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    if major(&snapshot.version) != major(STATE_VERSION) {
        return Err(StackError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: snapshot.version.clone(),
        }));
    }
    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        check_version(&snapshot)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        debug!(
            "Saving state (serial {}) to: {}",
            snapshot.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.write_atomic(&self.state_path, content.as_bytes()).await
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                StackError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await
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
        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        // One retry, after removing an expired lock.
        for _ in 0..2 {
            let opened = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await;

            match opened {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await.map_err(|e| {
                        StackError::State(StateError::LockFailed {
                            message: format!("Failed to write lock file: {e}"),
                        })
                    })?;
                    file.sync_all().await.map_err(|e| {
                        StackError::State(StateError::LockFailed {
                            message: format!("Failed to sync lock file: {e}"),
                        })
                    })?;

                    info!(
                        "Acquired state lock: {} (expires in {}s)",
                        lock_info.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(StackError::State(StateError::LockedByOther {
                                holder: existing.holder,
                                since: existing.acquired_at.to_rfc3339(),
                            }));
                        }
                        Some(existing) => {
                            debug!("Expired lock held by {} found, taking over", existing.holder);
                            self.delete_lock_file().await?;
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    return Err(StackError::State(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }));
                }
            }
        }

        Err(StackError::State(StateError::LockFailed {
            message: String::from("Lock file reappeared while replacing an expired lock"),
        }))
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

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock_info = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(StackError::State(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }));
            }
        };
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.write_atomic(&self.lock_path, content.as_bytes())
            .await
            .map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: e.to_string(),
                })
            })?;

        debug!("Refreshed state lock {lock_id} (expires in {}s)", LOCK_EXPIRY_SECS);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        info!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
