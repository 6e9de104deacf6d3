//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every mutation is a read-modify-write of the whole document, serialized
//! by the backend.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::lock::LockInfo;
use super::types::{ApplyHistoryEntry, ObservedResource};
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record for a logical name.
    async fn get(&self, name: &str) -> Result<Option<ObservedResource>>;

    /// Records a resource, replacing any previous record under its name.
    ///
    /// Fails if the provider identifier already belongs to another name.
    async fn put(&self, resource: ObservedResource) -> Result<()>;

    /// Removes the record for a logical name. Missing records are ignored.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Returns every record keyed by logical name.
    async fn all(&self) -> Result<BTreeMap<String, ObservedResource>>;

    /// Removes the whole state document.
    async fn clear(&self) -> Result<()>;

    /// Returns the apply history, oldest first.
    async fn history(&self) -> Result<Vec<ApplyHistoryEntry>>;

    /// Appends an apply history entry.
    async fn record_history(&self, entry: ApplyHistoryEntry) -> Result<()>;

    /// Acquires a lock on the state.
    ///
    /// At most one holder succeeds while the lock is live; an expired lock
    /// is taken over.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends a lock this process holds.
    ///
    /// Fails with [`crate::error::StateError::LockLost`] if the lock is no
    /// longer ours.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
