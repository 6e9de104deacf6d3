//! Attribute hashing for change detection.
//!
//! Hashes are computed over a canonical rendering of the attributes
//! (sorted keys, provider-computed fields removed) so that two structurally
//! equal mappings always produce the same digest.

use sha2::{Digest, Sha256};

use crate::model::{ResourceKind, ResourceModel, ResourceSpec};

use super::spec::Attributes;

/// Hasher for computing attribute and model fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's declared attributes.
    #[must_use]
    pub fn hash_attributes(&self, kind: ResourceKind, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());

        for (key, value) in attributes {
            if kind.is_computed(key) {
                continue;
            }
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            // BTreeMap-backed JSON objects serialize with sorted keys.
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a single resource, including its dependencies.
    #[must_use]
    pub fn hash_resource(&self, spec: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();
        hasher.update(spec.name.as_bytes());
        hasher.update(self.hash_attributes(spec.kind, &spec.attributes).as_bytes());
        for dep in &spec.depends_on {
            hasher.update(dep.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a whole model.
    ///
    /// Changes whenever any enabled resource changes.
    #[must_use]
    pub fn hash_model(&self, model: &ResourceModel) -> String {
        let mut hasher = Sha256::new();
        for spec in model.resources() {
            hasher.update(self.hash_resource(spec).as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("cidr_block", json!("10.0.0.0/16")), ("tags", json!({"b": 1, "a": 2}))]);
        let b = attrs(&[("tags", json!({"a": 2, "b": 1})), ("cidr_block", json!("10.0.0.0/16"))]);
        assert_eq!(
            hasher.hash_attributes(ResourceKind::Network, &a),
            hasher.hash_attributes(ResourceKind::Network, &b)
        );
    }

    #[test]
    fn test_hash_ignores_computed_fields() {
        let hasher = ConfigHasher::new();
        let declared = attrs(&[("cidr_block", json!("10.0.0.0/16"))]);
        let observed = attrs(&[
            ("cidr_block", json!("10.0.0.0/16")),
            ("arn", json!("arn:vpc/1")),
        ]);
        assert_eq!(
            hasher.hash_attributes(ResourceKind::Network, &declared),
            hasher.hash_attributes(ResourceKind::Network, &observed)
        );
    }

    #[test]
    fn test_hash_changes_with_values() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("cidr_block", json!("10.0.0.0/16"))]);
        let b = attrs(&[("cidr_block", json!("10.1.0.0/16"))]);
        assert_ne!(
            hasher.hash_attributes(ResourceKind::Network, &a),
            hasher.hash_attributes(ResourceKind::Network, &b)
        );
    }
}
