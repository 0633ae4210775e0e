//! State store trait definition.
//!
//! This module defines the common interface for snapshot storage backends.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::Result;

/// Trait for snapshot storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if nothing has been applied yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot, replacing the stored one atomically.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Deletes the stored snapshot.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `holder`.
    ///
    /// Fails with `StateError::LockedByOther` while an unexpired lock exists.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Pushes the expiry of the lock `lock_id` forward.
    ///
    /// Fails with `StateError::LockLost` if `lock_id` no longer owns the lock.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes the lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

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

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
