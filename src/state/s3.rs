//! S3-based state storage backend.
//!
//! Stores the same document as the local backend in an S3 bucket (or a
//! compatible service), with the lock object alongside it, so a team can
//! share one baseline.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{ApplyHistoryEntry, ObservedResource, STATE_VERSION, StateDocument};

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
    /// Serializes read-modify-write cycles within this process.
    write_guard: Mutex<()>,
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

    fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            write_guard: Mutex::new(()),
        }
    }

    /// Gets the full S3 key for an object.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_tagged(key).await?.map(|(content, _)| content))
    }

    /// Gets an object and its entity tag.
    async fn get_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::Corrupted {
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

    /// Writes the lock object only if `condition` holds.
    ///
    /// Returns false when S3 rejects the write because the object changed.
    async fn put_lock_if(&self, lock_info: &LockInfo, condition: LockCondition<'_>) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(content.into_bytes().into())
            .content_type("application/json");
        let request = match condition {
            LockCondition::Absent => request.if_none_match("*"),
            LockCondition::Unchanged(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e)
                if matches!(
                    e.raw_response().map(|r| r.status().as_u16()),
                    Some(409 | 412)
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(StateError::s3(format!("S3 lock put error: {e}")).into()),
        }
    }

    /// Reads the lock object with its entity tag.
    async fn read_lock(&self) -> Result<Option<(LockInfo, String)>> {
        let Some((content, etag)) = self.get_tagged(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info = parse_lock(&content)?;
        let etag = etag.ok_or_else(|| StateError::s3("Lock object has no entity tag"))?;
        Ok(Some((lock_info, etag)))
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

    /// Reads the state document, or an empty one if none exists yet.
    async fn read_document(&self) -> Result<StateDocument> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(StateDocument::new());
        };

        let document: StateDocument = serde_json::from_str(&json).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
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

    /// Writes the state document.
    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        let key = self.key(STATE_KEY);
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content).await?;
        debug!("State saved to S3 (serial {})", document.serial);
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
}

/// Precondition for a lock write.
enum LockCondition<'a> {
    /// No lock object exists.
    Absent,
    /// The lock object still has this entity tag.
    Unchanged(&'a str),
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        ConvergeError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

/// Normalizes a key prefix to be empty or end with a single `/`.
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

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, name: &str) -> Result<Option<ObservedResource>> {
        Ok(self.read_document().await?.resources.remove(name))
    }

    async fn put(&self, resource: ObservedResource) -> Result<()> {
        debug!("Recording {} as {}", resource.name, resource.provider_id);
        self.mutate(|doc| doc.insert_checked(resource).map_err(ConvergeError::from))
            .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
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
        let key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
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

        let written = match self.read_lock().await? {
            Some((existing, _)) if !existing.is_expired() => {
                return Err(ConvergeError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            Some((existing, etag)) => {
                debug!("Expired lock {} found, taking over", existing.lock_id);
                self.put_lock_if(&lock_info, LockCondition::Unchanged(&etag))
                    .await?
            }
            None => self.put_lock_if(&lock_info, LockCondition::Absent).await?,
        };

        if !written {
            let (holder, since) = self.get_lock_info().await?.map_or_else(
                || (String::from("unknown"), chrono::Utc::now().to_rfc3339()),
                |l| (l.holder, l.acquired_at.to_rfc3339()),
            );
            return Err(ConvergeError::State(StateError::LockedByOther { holder, since }));
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let lost = || {
            ConvergeError::State(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            })
        };

        let etag = match self.read_lock().await? {
            Some((current, etag)) if current.lock_id == lock.lock_id => etag,
            _ => return Err(lost()),
        };

        let renewed = lock.renewed();
        if !self
            .put_lock_if(&renewed, LockCondition::Unchanged(&etag))
            .await?
        {
            return Err(lost());
        }

        debug!("Renewed state lock {}", renewed.lock_id);
        Ok(renewed)
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

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock_info, _)| lock_info))
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;

    fn store_at(server: &MockServer) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3StateStore::with_client(Client::from_conf(config), "infra", Some("ref"))
    }

    async fn lock_is_absent(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/infra/ref/state.lock"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("content-type", "application/xml")
                    .set_body_string(NO_SUCH_KEY),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_acquire_writes_lock_only_if_absent() {
        let server = MockServer::start().await;
        lock_is_absent(&server).await;
        Mock::given(method("PUT"))
            .and(path("/infra/ref/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"v1\""))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store_at(&server).acquire_lock("ci").await.unwrap();
        assert_eq!(lock.holder, "ci");
    }

    #[tokio::test]
    async fn test_acquire_loses_race_on_precondition_failure() {
        let server = MockServer::start().await;
        lock_is_absent(&server).await;
        Mock::given(method("PUT"))
            .and(path("/infra/ref/state.lock"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let err = store_at(&server).acquire_lock("ci").await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_expired_lock_is_replaced_conditionally() {
        let server = MockServer::start().await;
        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        Mock::given(method("GET"))
            .and(path("/infra/ref/state.lock"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"stale\"")
                    .set_body_string(serde_json::to_string(&stale).unwrap()),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/infra/ref/state.lock"))
            .and(header("if-match", "\"stale\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store_at(&server).acquire_lock("next").await.unwrap();
        assert_ne!(lock.lock_id, stale.lock_id);
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("teams/infra/")), "teams/infra/");
        assert_eq!(normalize_prefix(Some("/ref")), "ref/");
    }
}
