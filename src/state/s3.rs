//! S3-based state storage backend.
//!
//! Remote state for shared environments. The snapshot is written as a single
//! object, so every PUT replaces it whole. The lock object is created with a
//! conditional PUT so that two runs cannot both acquire it, and is renewed or
//! taken over only through a PUT conditioned on the `ETag` last read.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, lease_lost};
use super::store::StateStore;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// HTTP status S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;

/// HTTP status S3 returns when two conditional writes race.
const CONDITIONAL_CONFLICT: u16 = 409;

/// HTTP status S3 returns for `If-Match` on a key that no longer exists.
const NOT_FOUND: u16 = 404;

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

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        StackError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

impl S3StateStore {
    /// Creates a new S3 state store.
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
        Ok(self.get_versioned(key).await?.map(|(content, _)| content))
    }

    /// Gets an object and its `ETag` from S3.
    async fn get_versioned(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::s3(format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
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
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Creates an object only if the key is free. Returns false if taken.
    async fn put_object_if_absent(&self, key: &str, content: &str) -> Result<bool> {
        self.put_conditional(key, content, None).await
    }

    /// Writes an object only if the key still holds `etag`, or only if the
    /// key is free when `etag` is `None`. Returns false if the condition failed.
    async fn put_conditional(&self, key: &str, content: &str, etag: Option<&str>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        let request = match etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(PRECONDITION_FAILED | CONDITIONAL_CONFLICT | NOT_FOUND)) {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 conditional put error: {sdk_err}")).into())
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
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

        info!(
            "Loaded state for project: {}/{} (serial {})",
            snapshot.project, snapshot.environment, snapshot.serial
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        if !self.put_object_if_absent(&key, &content).await? {
            let Some((existing, etag)) = self.get_versioned(&key).await? else {
                return Err(lease_lost(None));
            };
            let existing = parse_lock(&existing)?;
            if !existing.is_expired() {
                return Err(existing.contention(std::time::Duration::ZERO).into());
            }
            // Replace the expired lock only if it is still the one just read.
            let Some(etag) = etag else {
                return Err(StateError::s3("lock object has no ETag").into());
            };
            debug!("Expired lock {} found, taking over", existing.lock_id);
            if !self.put_conditional(&key, &content, Some(&etag)).await? {
                let current = self.get_lock_info().await?;
                return Err(lease_lost(current.as_ref()));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<()> {
        let key = self.key(LOCK_KEY);

        let Some((content, etag)) = self.get_versioned(&key).await? else {
            return Err(lease_lost(None));
        };
        let current = parse_lock(&content)?;
        if current.lock_id != lock.lock_id {
            return Err(lease_lost(Some(&current)));
        }
        let Some(etag) = etag else {
            return Err(StateError::s3("lock object has no ETag").into());
        };

        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        if self.put_conditional(&key, &content, Some(&etag)).await? {
            debug!("Renewed state lock {} until {}", lock.lock_id, lock.expires_at);
            Ok(())
        } else {
            let current = self.get_lock_info().await?;
            Err(lease_lost(current.as_ref()))
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let existing = parse_lock(&content)?;

            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        let key = self.key(LOCK_KEY);

        match self.get_object(&key).await? {
            Some(content) => parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/teams/plant/")), "teams/plant/");
        assert_eq!(normalize_prefix(Some("env")), "env/");
    }
}
