//! Ordered structural merge of attribute layers.
//!
//! Resource attributes are assembled from base defaults, provider defaults
//! and per-resource overrides, in that order. Later layers win on scalars,
//! objects merge recursively, lists are replaced unless the key is marked
//! additive, in which case they concatenate without duplicates. An explicit
//! `null` removes the key.

use serde_json::Value;
use tracing::trace;

use super::spec::Attributes;

/// Named attribute layer, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Built-in kind defaults plus the `defaults` section.
    Base,
    /// Defaults derived from the provisioning and machine sections.
    Provider,
    /// The resource's own `attributes`.
    Resource,
}

/// Merges layers in order, returning the effective attributes.
#[must_use]
pub fn merge_layers(layers: &[(Layer, &Attributes)], additive: &[&str]) -> Attributes {
    let mut merged = Attributes::new();
    for (layer, attrs) in layers {
        trace!("Merging {:?} layer ({} keys)", layer, attrs.len());
        merge_into(&mut merged, attrs, additive);
    }
    merged
}

/// Merges `overlay` into `base` at the top level.
pub fn merge_into(base: &mut Attributes, overlay: &Attributes, additive: &[&str]) {
    for (key, value) in overlay {
        if value.is_null() {
            base.remove(key);
            continue;
        }

        let is_additive = additive.contains(&key.as_str());
        match (base.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(extra)) if is_additive => {
                for item in extra {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
            (Some(existing), _) => merge_value(existing, value),
            (None, _) => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Recursive merge for nested values: objects merge, everything else replaces.
fn merge_value(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    base_map.remove(key);
                } else if let Some(existing) = base_map.get_mut(key) {
                    merge_value(existing, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
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

    #[test]
    fn test_later_layer_wins_on_scalars() {
        let base = attrs(json!({ "flavor": "t2.medium", "tenancy": "default" }));
        let resource = attrs(json!({ "flavor": "m5.large" }));
        let merged = merge_layers(&[(Layer::Base, &base), (Layer::Resource, &resource)], &[]);
        assert_eq!(merged["flavor"], "m5.large");
        assert_eq!(merged["tenancy"], "default");
    }

    #[test]
    fn test_objects_merge_recursively() {
        let base = attrs(json!({ "opts": { "format": "pem", "type": "rsa" } }));
        let resource = attrs(json!({ "opts": { "type": "ed25519" } }));
        let merged = merge_layers(&[(Layer::Base, &base), (Layer::Resource, &resource)], &[]);
        assert_eq!(merged["opts"], json!({ "format": "pem", "type": "ed25519" }));
    }

    #[test]
    fn test_lists_replace_unless_additive() {
        let provider = attrs(json!({ "recipes": ["base"], "zones": ["a"] }));
        let resource = attrs(json!({ "recipes": ["sql", "base"], "zones": ["b"] }));
        let merged = merge_layers(
            &[(Layer::Provider, &provider), (Layer::Resource, &resource)],
            &["recipes"],
        );
        assert_eq!(merged["recipes"], json!(["base", "sql"]));
        assert_eq!(merged["zones"], json!(["b"]));
    }

    #[test]
    fn test_null_removes_key() {
        let base = attrs(json!({ "bootstrap_proxy": "http://proxy:3128" }));
        let resource = attrs(json!({ "bootstrap_proxy": null }));
        let merged = merge_layers(&[(Layer::Base, &base), (Layer::Resource, &resource)], &[]);
        assert!(!merged.contains_key("bootstrap_proxy"));
    }
}
