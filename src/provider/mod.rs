//! Provider boundary.
//!
//! The executor talks to the cloud control plane only through
//! [`CloudProvider`]. Concrete drivers translate the four resource
//! operations into whatever the backend speaks.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{Attributes, DriverKind, ProvisioningConfig};
use crate::error::{ConfigError, ConvergeError, ProviderError, Result};
use crate::model::ResourceKind;
use crate::state::ObservedResource;

pub use http::HttpProvider;
pub use memory::{Fault, MemoryProvider};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Attribute carrying the logical name on every request.
///
/// Drivers use it as an upsert key, which is what makes creates safe to
/// retry.
pub const NAME_ATTRIBUTE: &str = "name";

/// Mutating provider operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

/// Abstract cloud control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Creates a resource and returns its provider identifier.
    async fn create_resource(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<String>;

    /// Updates a resource in place.
    async fn update_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> ProviderResult<()>;

    /// Deletes a resource.
    async fn delete_resource(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()>;

    /// Reads the live attributes of a resource.
    async fn describe_resource(
        &self,
        provider_id: &str,
        kind: ResourceKind,
    ) -> ProviderResult<Attributes>;

    /// Whether repeating `operation` on `kind` can never duplicate a side effect.
    fn supports_safe_retry(&self, kind: ResourceKind, operation: Operation) -> bool;

    /// Driver name, for logs and reports.
    fn name(&self) -> &'static str;
}

/// Builds the provider selected by the declaration.
///
/// The memory driver starts from the recorded resources so that a simulated
/// control plane agrees with the state store across invocations.
///
/// # Errors
///
/// Returns an error if the driver settings are incomplete or the HTTP client
/// cannot be created.
pub fn build_provider(
    config: &ProvisioningConfig,
    recorded: &BTreeMap<String, ObservedResource>,
) -> Result<Arc<dyn CloudProvider>> {
    match config.driver {
        DriverKind::Memory => {
            info!("Using in-memory provider ({} recorded resources)", recorded.len());
            Ok(Arc::new(MemoryProvider::from_records(recorded.values())))
        }
        DriverKind::Http => {
            let http = config.http.as_ref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation(
                    "The http driver requires provisioning.http.endpoint",
                    "provisioning.http",
                ))
            })?;
            info!("Using HTTP provider at {}", http.endpoint);
            let provider = HttpProvider::new(
                http,
                config.credentials.as_deref(),
                config.region.as_deref(),
                config.zone.as_deref(),
            )?;
            Ok(Arc::new(provider))
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{op}")
    }
}
