//! Diff engine for comparing declared vs observed state.
//!
//! Attribute mappings are compared by deep structural equality after the
//! kind's provider-computed fields are removed from both sides.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{Attributes, ConfigHasher};
use crate::model::{ResourceKind, ResourceModel, ResourceSpec};
use crate::state::ObservedResource;

/// Pseudo-attribute reported when the dependency set changed.
pub const DEPENDS_ON_FIELD: &str = "depends_on";

/// Engine for computing diffs between declared and observed states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Attribute hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Per-field details.
    pub details: Vec<DiffDetail>,
    /// Hash of the observed attributes (if any).
    pub old_hash: Option<String>,
    /// Hash of the declared attributes (if any).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Observed value.
    pub old_value: Option<Value>,
    /// Declared value.
    pub new_value: Option<Value>,
}

/// Complete diff result.
#[derive(Debug, Serialize)]
pub struct DiffResult {
    /// All resource diffs, declared resources first.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the model and observed state.
    #[must_use]
    pub fn compute_diff(
        &self,
        model: &ResourceModel,
        observed: &BTreeMap<String, ObservedResource>,
    ) -> DiffResult {
        let mut diffs: Vec<ResourceDiff> = model
            .resources()
            .iter()
            .map(|spec| self.diff_resource(spec, observed.get(&spec.name)))
            .collect();

        for record in observed.values() {
            if model.get(&record.name).is_none() {
                debug!("Found orphaned resource: {}", record.name);
                diffs.push(self.diff_removed(record));
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let (creates, updates, deletes, unchanged) = (
            count(DiffType::Create),
            count(DiffType::Update),
            count(DiffType::Delete),
            count(DiffType::NoChange),
        );

        DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
        }
    }

    /// Diffs one declared resource against its record, if any.
    #[must_use]
    pub fn diff_resource(
        &self,
        spec: &ResourceSpec,
        observed: Option<&ObservedResource>,
    ) -> ResourceDiff {
        let new_hash = Some(self.hasher.hash_attributes(spec.kind, &spec.attributes));

        let Some(observed) = observed else {
            debug!("{} needs to be created", spec.name);
            return ResourceDiff {
                name: spec.name.clone(),
                kind: spec.kind,
                diff_type: DiffType::Create,
                details: spec
                    .attributes
                    .iter()
                    .filter(|(k, _)| !spec.kind.is_computed(k))
                    .map(|(k, v)| DiffDetail {
                        field: k.clone(),
                        old_value: None,
                        new_value: Some(v.clone()),
                    })
                    .collect(),
                old_hash: None,
                new_hash,
            };
        };

        let mut details = attribute_details(spec.kind, &observed.attributes, &spec.attributes);

        let old_deps: BTreeSet<&String> = observed.depends_on.iter().collect();
        let new_deps: BTreeSet<&String> = spec.depends_on.iter().collect();
        if old_deps != new_deps {
            details.push(DiffDetail {
                field: String::from(DEPENDS_ON_FIELD),
                old_value: Some(serde_json::json!(observed.depends_on)),
                new_value: Some(serde_json::json!(spec.depends_on)),
            });
        }

        let diff_type = if details.is_empty() {
            DiffType::NoChange
        } else {
            debug!("{} needs update ({} fields)", spec.name, details.len());
            DiffType::Update
        };

        ResourceDiff {
            name: spec.name.clone(),
            kind: spec.kind,
            diff_type,
            details,
            old_hash: Some(
                self.hasher
                    .hash_attributes(observed.kind, &observed.attributes),
            ),
            new_hash,
        }
    }

    /// Diff entry for a recorded resource that is no longer declared.
    #[must_use]
    pub fn diff_removed(&self, observed: &ObservedResource) -> ResourceDiff {
        ResourceDiff {
            name: observed.name.clone(),
            kind: observed.kind,
            diff_type: DiffType::Delete,
            details: vec![DiffDetail {
                field: String::from("provider_id"),
                old_value: Some(Value::String(observed.provider_id.clone())),
                new_value: None,
            }],
            old_hash: Some(observed.attributes_hash.clone()),
            new_hash: None,
        }
    }
}

/// Per-key differences, ignoring provider-computed fields.
#[must_use]
pub fn attribute_details(
    kind: ResourceKind,
    observed: &Attributes,
    declared: &Attributes,
) -> Vec<DiffDetail> {
    let keys: BTreeSet<&String> = observed.keys().chain(declared.keys()).collect();

    keys.into_iter()
        .filter(|k| !kind.is_computed(k))
        .filter_map(|k| {
            let old = observed.get(k);
            let new = declared.get(k);
            (old != new).then(|| DiffDetail {
                field: k.clone(),
                old_value: old.cloned(),
                new_value: new.cloned(),
            })
        })
        .collect()
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }
}

impl ResourceDiff {
    /// Names of the changed fields.
    #[must_use]
    pub fn changed_fields(&self) -> BTreeSet<String> {
        self.details.iter().map(|d| d.field.clone()).collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if self.diff_type == DiffType::Update {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        }
    }

    fn spec(name: &str, attributes: Value, depends_on: &[&str]) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            kind: ResourceKind::Subnet,
            attributes: attrs(attributes),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        }
    }

    fn observed(spec: &ResourceSpec) -> ObservedResource {
        ObservedResource::new(
            &spec.name,
            spec.kind,
            "subnet-1",
            spec.attributes.clone(),
            spec.depends_on.clone(),
        )
    }

    #[test]
    fn test_absent_is_create() {
        let engine = DiffEngine::new();
        let s = spec("sub1", json!({ "cidr_block": "10.0.1.0/24" }), &["vpc1"]);
        let diff = engine.diff_resource(&s, None);
        assert_eq!(diff.diff_type, DiffType::Create);
        assert_eq!(diff.details.len(), 1);
    }

    #[test]
    fn test_identical_is_no_change() {
        let engine = DiffEngine::new();
        let s = spec("sub1", json!({ "cidr_block": "10.0.1.0/24" }), &["vpc1"]);
        let diff = engine.diff_resource(&s, Some(&observed(&s)));
        assert_eq!(diff.diff_type, DiffType::NoChange);
        assert_eq!(diff.old_hash, diff.new_hash);
    }

    #[test]
    fn test_computed_fields_are_ignored() {
        let engine = DiffEngine::new();
        let s = spec("sub1", json!({ "cidr_block": "10.0.1.0/24" }), &[]);
        let mut record = observed(&s);
        record
            .attributes
            .insert(String::from("available_ip_address_count"), json!(251));
        let diff = engine.diff_resource(&s, Some(&record));
        assert_eq!(diff.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_declared_state_attribute_is_compared() {
        let engine = DiffEngine::new();
        let old = spec("sub1", json!({ "cidr_block": "10.0.1.0/24", "state": "pending" }), &[]);
        let new = spec("sub1", json!({ "cidr_block": "10.0.1.0/24", "state": "ready" }), &[]);
        let diff = engine.diff_resource(&new, Some(&observed(&old)));
        assert_eq!(diff.diff_type, DiffType::Update);
        assert!(diff.changed_fields().contains("state"));
    }

    #[test]
    fn test_changed_attributes_are_reported() {
        let engine = DiffEngine::new();
        let old = spec(
            "sub1",
            json!({ "cidr_block": "10.0.1.0/24", "map_public_ip_on_launch": false }),
            &[],
        );
        let new = spec(
            "sub1",
            json!({ "cidr_block": "10.0.2.0/24", "availability_zone": "us-west-2b" }),
            &[],
        );
        let diff = engine.diff_resource(&new, Some(&observed(&old)));
        assert_eq!(diff.diff_type, DiffType::Update);
        assert_eq!(
            diff.changed_fields().into_iter().collect::<Vec<_>>(),
            vec!["availability_zone", "cidr_block", "map_public_ip_on_launch"]
        );
    }

    #[test]
    fn test_dependency_change_is_update() {
        let engine = DiffEngine::new();
        let old = spec("sub1", json!({ "cidr_block": "10.0.1.0/24" }), &["vpc1"]);
        let new = spec("sub1", json!({ "cidr_block": "10.0.1.0/24" }), &["vpc1", "rt1"]);
        let diff = engine.diff_resource(&new, Some(&observed(&old)));
        assert_eq!(diff.diff_type, DiffType::Update);
        assert!(diff.changed_fields().contains(DEPENDS_ON_FIELD));
    }

    #[test]
    fn test_dependency_order_is_not_a_change() {
        let engine = DiffEngine::new();
        let old = spec("sub1", json!({}), &["vpc1", "rt1"]);
        let new = spec("sub1", json!({}), &["rt1", "vpc1"]);
        let diff = engine.diff_resource(&new, Some(&observed(&old)));
        assert_eq!(diff.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_nested_values_compare_structurally() {
        let details = attribute_details(
            ResourceKind::RouteTable,
            &attrs(json!({ "routes": { "0.0.0.0/0": "igw", "10.0.0.0/8": "local" } })),
            &attrs(json!({ "routes": { "10.0.0.0/8": "local", "0.0.0.0/0": "igw" } })),
        );
        assert!(details.is_empty());
    }
}
