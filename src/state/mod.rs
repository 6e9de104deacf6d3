//! State management module.
//!
//! This module provides persistent storage of the last-applied state of
//! every managed resource, keyed by logical name, plus the apply history.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{ApplyHistoryEntry, ApplyOperation, ObservedResource, STATE_VERSION, StateDocument};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, ConvergeError, Result};

/// Opens the configured state backend.
///
/// A relative local `path` is resolved against `base_dir`, usually the
/// directory holding the declaration file.
///
/// # Errors
///
/// Returns a validation error if the S3 backend has no bucket, or an error
/// if the S3 client cannot be initialized.
pub async fn open_store(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(PathBuf::from(p)));
            debug!("Using local state in {}", dir.display());
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation(
                    "S3 state backend requires a bucket",
                    "state.bucket",
                ))
            })?;
            debug!("Using S3 state in bucket {}", bucket);
            let store =
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_local_store_defaults_to_state_dir() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&StateConfig::default(), dir.path()).await.unwrap();
        assert_eq!(store.backend_type(), "local");
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_s3_store_requires_bucket() {
        let config = StateConfig {
            backend: StateBackend::S3,
            ..StateConfig::default()
        };
        let Err(err) = open_store(&config, Path::new(".")).await else {
            panic!("an S3 backend without a bucket must be rejected");
        };
        assert!(err.is_validation());
    }
}
