//! S3-based state storage backend.
//!
//! Snapshots live at `s3://<bucket>/<prefix>/state.json`, so a team can share
//! one stack. The lock object is written with `If-None-Match: *`, which makes
//! two concurrent acquisitions race on S3 instead of on a read-then-write.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::local::check_version;
use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// HTTP status S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// Normalizes a key prefix to either empty or `"<prefix>/"`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;
        check_version(&snapshot)?;

        info!(
            "Loaded state for {}/{} (serial {})",
            snapshot.project, snapshot.environment, snapshot.serial
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.put_object(&key, &content).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        if let Some(existing) = self.get_lock_info().await? {
            if !existing.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
            self.delete_object(&key).await?;
        }

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

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_none_match("*")
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await;

        if let Err(sdk_err) = result {
            let status = sdk_err.raw_response().map(|r| r.status().as_u16());
            if status == Some(PRECONDITION_FAILED) {
                let holder = self
                    .get_lock_info()
                    .await?
                    .map_or_else(|| String::from("unknown"), |l| l.holder);
                return Err(StackError::State(StateError::LockedByOther {
                    holder,
                    since: String::from("just now"),
                }));
            }
            return Err(StackError::State(StateError::LockFailed {
                message: format!("S3 put error: {sdk_err}"),
            }));
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let mut lock_info = match self.get_lock_info().await? {
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
        self.put_object(&self.key(LOCK_KEY), &content).await?;

        debug!("Refreshed state lock {lock_id} (expires in {}s)", LOCK_EXPIRY_SECS);
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        let key = self.key(LOCK_KEY);
        info!("Force-removing state lock at s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("apigw-alb/prod/")), "apigw-alb/prod/");
        assert_eq!(normalize_prefix(Some("/stacks")), "stacks/");
    }
}
