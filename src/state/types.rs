//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of every managed resource,
//! used as the observed baseline for the next plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Attributes;
use crate::error::StateError;
use crate::model::ResourceKind;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept in the document.
const MAX_HISTORY: usize = 100;

/// The persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Incremented on every write.
    #[serde(default)]
    pub serial: u64,
    /// Observed resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ObservedResource>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Last-applied state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedResource {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Attributes as last applied.
    pub attributes: Attributes,
    /// Dependencies at the time of the last apply.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Hash of the applied attributes.
    pub attributes_hash: String,
    /// Provider-computed attributes from the last describe.
    #[serde(default)]
    pub computed: Attributes,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last applied.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyHistoryEntry {
    /// When the cycle finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Model fingerprint the plan was computed from.
    pub fingerprint: String,
    /// Resources the cycle touched.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of apply operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Converging toward the declaration.
    Apply,
    /// Tearing everything down.
    Destroy,
}

impl StateDocument {
    /// Creates a new empty state document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ObservedResource> {
        self.resources.get(name)
    }

    /// Finds the logical name holding a provider identifier.
    #[must_use]
    pub fn holder_of(&self, provider_id: &str) -> Option<&str> {
        self.resources
            .values()
            .find(|r| r.provider_id == provider_id)
            .map(|r| r.name.as_str())
    }

    /// Adds or replaces a resource, keeping its original creation time.
    pub fn set(&mut self, mut resource: ObservedResource) {
        if let Some(existing) = self.resources.get(&resource.name)
            && existing.provider_id == resource.provider_id
        {
            resource.created_at = existing.created_at;
        }
        self.resources.insert(resource.name.clone(), resource);
        self.touch();
    }

    /// Adds or replaces a resource, refusing a provider identifier that is
    /// already recorded under another logical name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::IdentifierConflict`] on such a collision.
    pub fn insert_checked(&mut self, resource: ObservedResource) -> Result<(), StateError> {
        if let Some(existing) = self.holder_of(&resource.provider_id)
            && existing != resource.name
        {
            return Err(StateError::IdentifierConflict {
                provider_id: resource.provider_id.clone(),
                existing: existing.to_string(),
                name: resource.name,
            });
        }
        self.set(resource);
        Ok(())
    }

    /// Removes a resource by logical name.
    pub fn remove(&mut self, name: &str) -> Option<ObservedResource> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.touch();
        }
        result
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.touch();
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservedResource {
    /// Creates a record for a freshly applied resource.
    #[must_use]
    pub fn new(
        name: &str,
        kind: ResourceKind,
        provider_id: &str,
        attributes: Attributes,
        depends_on: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let attributes_hash = crate::config::ConfigHasher::new().hash_attributes(kind, &attributes);
        Self {
            name: name.to_string(),
            kind,
            provider_id: provider_id.to_string(),
            attributes,
            depends_on,
            attributes_hash,
            computed: Attributes::new(),
            created_at: now,
            applied_at: now,
        }
    }

    /// Attaches provider-computed attributes.
    #[must_use]
    pub fn with_computed(mut self, computed: Attributes) -> Self {
        self.computed = computed;
        self
    }
}

impl ApplyHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(
        operation: ApplyOperation,
        fingerprint: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            fingerprint: fingerprint.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vpc(id: &str) -> ObservedResource {
        let attrs: Attributes = [(String::from("cidr_block"), json!("10.0.0.0/16"))]
            .into_iter()
            .collect();
        ObservedResource::new("vpc1", ResourceKind::Network, id, attrs, Vec::new())
    }

    #[test]
    fn test_set_keeps_creation_time() {
        let mut doc = StateDocument::new();
        let first = vpc("vpc-1");
        let created = first.created_at;
        doc.set(first);

        let mut second = vpc("vpc-1");
        second.created_at = created + chrono::Duration::seconds(60);
        doc.set(second);

        assert_eq!(doc.get("vpc1").map(|r| r.created_at), Some(created));
        assert_eq!(doc.serial, 2);
    }

    #[test]
    fn test_holder_of() {
        let mut doc = StateDocument::new();
        doc.set(vpc("vpc-7"));
        assert_eq!(doc.holder_of("vpc-7"), Some("vpc1"));
        assert_eq!(doc.holder_of("vpc-8"), None);
    }

    #[test]
    fn test_identifier_conflict() {
        let mut doc = StateDocument::new();
        doc.insert_checked(vpc("vpc-1")).unwrap();

        let mut other = vpc("vpc-1");
        other.name = String::from("vpc2");
        let err = doc.insert_checked(other).unwrap_err();
        assert!(matches!(err, StateError::IdentifierConflict { .. }));

        // Same name, same identifier is an update.
        doc.insert_checked(vpc("vpc-1")).unwrap();
        assert_eq!(doc.resources.len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut doc = StateDocument::new();
        for i in 0..(MAX_HISTORY + 5) {
            doc.add_history(ApplyHistoryEntry::new(
                ApplyOperation::Apply,
                &i.to_string(),
                Vec::new(),
                None,
            ));
        }
        assert_eq!(doc.history.len(), MAX_HISTORY);
        assert_eq!(doc.history[0].fingerprint, "5");
    }

    #[test]
    fn test_document_roundtrip_layout() {
        let mut doc = StateDocument::new();
        doc.set(vpc("vpc-1"));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["resources"]["vpc1"]["provider_id"], "vpc-1");
        assert_eq!(json["resources"]["vpc1"]["kind"], "network");
        assert_eq!(json["serial"], 1);
    }
}
