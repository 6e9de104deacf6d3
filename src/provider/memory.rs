//! In-process simulated control plane.
//!
//! Resources live in a map keyed by provider identifier. Creates upsert on
//! the logical name, deletes are refused while another resource still
//! references the target, and faults can be injected per logical name.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{CloudProvider, NAME_ATTRIBUTE, Operation, ProviderResult};
use crate::config::Attributes;
use crate::error::ProviderError;
use crate::model::ResourceKind;
use crate::state::ObservedResource;

/// An injected failure.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Every call for the resource fails with this error.
    Permanent(ProviderError),
    /// The next `failures` calls fail, then calls succeed.
    Transient {
        /// Remaining failing calls.
        failures: u32,
        /// Error returned while failing.
        error: ProviderError,
    },
}

/// A resource held by the simulated control plane.
#[derive(Debug, Clone)]
struct StoredResource {
    kind: ResourceKind,
    name: String,
    attributes: Attributes,
}

#[derive(Debug, Default)]
struct ControlPlane {
    resources: BTreeMap<String, StoredResource>,
    counters: HashMap<ResourceKind, u64>,
    faults: HashMap<String, Fault>,
    calls: HashMap<String, u32>,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    plane: Mutex<ControlPlane>,
}

impl MemoryProvider {
    /// Creates an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a control plane that already holds the recorded resources.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ObservedResource>) -> Self {
        let mut plane = ControlPlane::default();
        for record in records {
            if let Some(n) = sequence_number(record.kind, &record.provider_id) {
                let counter = plane.counters.entry(record.kind).or_insert(0);
                *counter = (*counter).max(n);
            }
            plane.resources.insert(
                record.provider_id.clone(),
                StoredResource {
                    kind: record.kind,
                    name: record.name.clone(),
                    attributes: record.attributes.clone(),
                },
            );
        }
        Self {
            plane: Mutex::new(plane),
        }
    }

    /// Injects a fault for a logical name.
    #[must_use]
    pub fn with_fault(mut self, name: &str, fault: Fault) -> Self {
        self.plane.get_mut().faults.insert(name.to_string(), fault);
        self
    }

    /// Number of mutating calls made for a logical name.
    pub async fn call_count(&self, name: &str) -> u32 {
        self.plane.lock().await.calls.get(name).copied().unwrap_or(0)
    }

    /// Number of live resources.
    pub async fn resource_count(&self) -> usize {
        self.plane.lock().await.resources.len()
    }

    /// Removes a resource behind the executor's back, as drift would.
    pub async fn remove_out_of_band(&self, provider_id: &str) -> bool {
        self.plane.lock().await.resources.remove(provider_id).is_some()
    }
}

impl ControlPlane {
    /// Counts the call and returns the injected error, if any.
    fn check_fault(&mut self, name: &str) -> ProviderResult<()> {
        *self.calls.entry(name.to_string()).or_insert(0) += 1;

        match self.faults.get_mut(name) {
            None => Ok(()),
            Some(Fault::Permanent(error)) => Err(error.clone()),
            Some(Fault::Transient { failures, error }) => {
                if *failures == 0 {
                    return Ok(());
                }
                *failures -= 1;
                Err(error.clone())
            }
        }
    }

    /// Rejects `<attr>_id` values that point at nothing of the right kind.
    fn check_references(&self, kind: ResourceKind, attributes: &Attributes) -> ProviderResult<()> {
        for (attribute, expected) in kind.references() {
            let key = format!("{attribute}_id");
            let Some(id) = attributes.get(&key).and_then(serde_json::Value::as_str) else {
                continue;
            };
            match self.resources.get(id) {
                Some(target) if target.kind == *expected => {}
                _ => {
                    return Err(ProviderError::rejected(
                        400,
                        format!("{key} '{id}' does not name a live {expected}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn mint_id(&mut self, kind: ResourceKind) -> String {
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-{counter}", kind.id_prefix())
    }

    fn name_of(&self, provider_id: &str) -> ProviderResult<String> {
        self.resources
            .get(provider_id)
            .map(|r| r.name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }
}

/// Parses the counter out of an identifier minted by this provider.
fn sequence_number(kind: ResourceKind, provider_id: &str) -> Option<u64> {
    provider_id
        .strip_prefix(kind.id_prefix())
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|n| n.parse().ok())
}

/// Computed fields the simulated plane reports on describe.
fn computed_fields(kind: ResourceKind, provider_id: &str) -> Attributes {
    let mut computed = Attributes::new();
    computed.insert(
        String::from("arn"),
        serde_json::Value::String(format!("arn:memory:{kind}/{provider_id}")),
    );
    computed.insert(
        String::from("lifecycle_state"),
        serde_json::Value::String(String::from("available")),
    );
    computed
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn create_resource(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<String> {
        let name = attributes
            .get(NAME_ATTRIBUTE)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                ProviderError::rejected(400, format!("missing '{NAME_ATTRIBUTE}' attribute"))
            })?
            .to_string();

        let mut plane = self.plane.lock().await;
        plane.check_fault(&name)?;
        plane.check_references(kind, attributes)?;

        let existing = plane
            .resources
            .iter()
            .find(|(_, r)| r.kind == kind && r.name == name)
            .map(|(id, _)| id.clone());

        let id = match existing {
            Some(id) => {
                debug!("Upserting existing {} {} ({})", kind, name, id);
                id
            }
            None => plane.mint_id(kind),
        };

        trace!("Created {} {} as {}", kind, name, id);
        plane.resources.insert(
            id.clone(),
            StoredResource {
                kind,
                name,
                attributes: attributes.clone(),
            },
        );
        Ok(id)
    }

    async fn update_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<()> {
        let mut plane = self.plane.lock().await;
        let name = plane.name_of(provider_id)?;
        plane.check_fault(&name)?;
        plane.check_references(kind, attributes)?;

        if let Some(resource) = plane.resources.get_mut(provider_id) {
            resource.attributes = attributes.clone();
        }
        trace!("Updated {} {}", kind, provider_id);
        Ok(())
    }

    async fn delete_resource(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()> {
        let mut plane = self.plane.lock().await;
        let name = plane.name_of(provider_id)?;
        plane.check_fault(&name)?;

        let dependent = plane.resources.values().find(|r| {
            r.kind.references().iter().any(|(attribute, _)| {
                r.attributes
                    .get(&format!("{attribute}_id"))
                    .and_then(serde_json::Value::as_str)
                    == Some(provider_id)
            })
        });
        if let Some(dependent) = dependent {
            return Err(ProviderError::rejected(
                409,
                format!("{kind} {provider_id} is still in use by '{}'", dependent.name),
            ));
        }

        plane.resources.remove(provider_id);
        trace!("Deleted {} {}", kind, provider_id);
        Ok(())
    }

    async fn describe_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
    ) -> ProviderResult<Attributes> {
        let plane = self.plane.lock().await;
        let resource = plane
            .resources
            .get(provider_id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })?;

        let mut attributes = resource.attributes.clone();
        attributes.extend(computed_fields(kind, provider_id));
        Ok(attributes)
    }

    fn supports_safe_retry(&self, _kind: ResourceKind, _operation: Operation) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        }
    }

    #[tokio::test]
    async fn test_create_mints_sequential_ids() {
        let provider = MemoryProvider::new();
        let a = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc1" })))
            .await
            .unwrap();
        let b = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc2" })))
            .await
            .unwrap();
        assert_eq!(a, "vpc-1");
        assert_eq!(b, "vpc-2");
    }

    #[tokio::test]
    async fn test_create_upserts_on_name() {
        let provider = MemoryProvider::new();
        let first = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc1" })))
            .await
            .unwrap();
        let again = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc1" })))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(provider.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_reference_must_exist() {
        let provider = MemoryProvider::new();
        let err = provider
            .create_resource(
                ResourceKind::Subnet,
                &attrs(json!({ "name": "sub1", "vpc_id": "vpc-9" })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_delete_refused_while_referenced() {
        let provider = MemoryProvider::new();
        let vpc = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc1" })))
            .await
            .unwrap();
        let subnet = provider
            .create_resource(
                ResourceKind::Subnet,
                &attrs(json!({ "name": "sub1", "vpc_id": vpc })),
            )
            .await
            .unwrap();

        let err = provider
            .delete_resource(&vpc, ResourceKind::Network)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 409, .. }));

        provider
            .delete_resource(&subnet, ResourceKind::Subnet)
            .await
            .unwrap();
        provider
            .delete_resource(&vpc, ResourceKind::Network)
            .await
            .unwrap();
        assert_eq!(provider.resource_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let provider = MemoryProvider::new().with_fault(
            "vpc1",
            Fault::Transient {
                failures: 1,
                error: ProviderError::Unavailable {
                    message: String::from("throttled"),
                },
            },
        );
        let body = attrs(json!({ "name": "vpc1" }));
        assert!(provider.create_resource(ResourceKind::Network, &body).await.is_err());
        assert!(provider.create_resource(ResourceKind::Network, &body).await.is_ok());
        assert_eq!(provider.call_count("vpc1").await, 2);
    }

    #[tokio::test]
    async fn test_describe_adds_computed_fields() {
        let provider = MemoryProvider::new();
        let id = provider
            .create_resource(
                ResourceKind::Network,
                &attrs(json!({ "name": "vpc1", "cidr_block": "10.0.0.0/16" })),
            )
            .await
            .unwrap();
        let described = provider
            .describe_resource(&id, ResourceKind::Network)
            .await
            .unwrap();
        assert_eq!(described["cidr_block"], "10.0.0.0/16");
        assert_eq!(described["lifecycle_state"], "available");

        assert!(matches!(
            provider.describe_resource("vpc-404", ResourceKind::Network).await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_records_continues_numbering() {
        let record = ObservedResource::new(
            "vpc1",
            ResourceKind::Network,
            "vpc-3",
            Attributes::new(),
            Vec::new(),
        );
        let provider = MemoryProvider::from_records([&record]);
        let id = provider
            .create_resource(ResourceKind::Network, &attrs(json!({ "name": "vpc2" })))
            .await
            .unwrap();
        assert_eq!(id, "vpc-4");
    }
}
