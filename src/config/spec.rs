//! Declaration types for the provisioning system.
//!
//! This module defines the structs that map to the `converge.yaml` file.
//! Every recognized option has a typed field; there is no free-form driver
//! section whose keys get attached at runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::ResourceKind;

/// Attribute mapping of a resource.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The root declaration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Provider selection and locality.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Provider defaults for compute instances.
    #[serde(default)]
    pub machine: MachineDefaults,
    /// Base defaults per resource kind.
    #[serde(default)]
    pub defaults: BTreeMap<ResourceKind, Attributes>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Retry policy for provider calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project, used to derive hostnames.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Provider selection, credentials and locality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProvisioningConfig {
    /// Which provider backend to use.
    #[serde(default)]
    pub driver: DriverKind,
    /// Opaque provider authentication blob, passed through untouched.
    #[serde(default)]
    pub credentials: Option<String>,
    /// Provider region.
    #[serde(default)]
    pub region: Option<String>,
    /// Provider zone.
    #[serde(default)]
    pub zone: Option<String>,
    /// Bootstrap steps applied to every compute instance.
    #[serde(default)]
    pub common_recipes: Vec<String>,
    /// Settings for the HTTP gateway driver.
    #[serde(default)]
    pub http: Option<HttpDriverConfig>,
}

/// Provider backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process simulated control plane.
    #[default]
    Memory,
    /// JSON control-plane gateway over HTTP.
    Http,
}

/// Settings for the HTTP gateway driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpDriverConfig {
    /// Base URL of the gateway.
    pub endpoint: String,
    /// Request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Provider defaults applied to every compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineDefaults {
    /// Instance size.
    #[serde(default = "default_flavor")]
    pub flavor: String,
    /// Key pair name installed on the instance.
    #[serde(default)]
    pub key_name: Option<String>,
    /// User for the SSH bootstrap.
    #[serde(default)]
    pub ssh_username: Option<String>,
    /// Machine image.
    #[serde(default)]
    pub image_id: Option<String>,
    /// Security groups attached to the instance.
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// Proxy used during bootstrap.
    #[serde(default)]
    pub bootstrap_proxy: Option<String>,
    /// Bootstrap over the private address instead of the public one.
    #[serde(default)]
    pub use_private_ip_for_ssh: bool,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per action, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for the backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Executor settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum provider calls in flight at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Logical name, unique within the declaration.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Whether the resource should exist. Disabled resources are removed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Explicit dependencies by logical name.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-resource attribute overrides.
    #[serde(default)]
    pub attributes: Attributes,
}

// Default value functions

const fn default_http_timeout() -> u64 {
    30
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_enabled() -> bool {
    true
}

fn default_flavor() -> String {
    String::from("t2.medium")
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for MachineDefaults {
    fn default() -> Self {
        Self {
            flavor: default_flavor(),
            key_name: None,
            ssh_username: None,
            image_id: None,
            security_group_ids: Vec::new(),
            bootstrap_proxy: None,
            use_private_ip_for_ssh: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

impl InfraConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }
}

impl MachineDefaults {
    /// Renders the defaults as a provider-default attribute layer.
    #[must_use]
    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(
            String::from("flavor"),
            serde_json::Value::String(self.flavor.clone()),
        );
        for (key, value) in [
            ("key_name", &self.key_name),
            ("ssh_username", &self.ssh_username),
            ("image_id", &self.image_id),
            ("bootstrap_proxy", &self.bootstrap_proxy),
        ] {
            if let Some(value) = value {
                attrs.insert(key.to_string(), serde_json::Value::String(value.clone()));
            }
        }
        if !self.security_group_ids.is_empty() {
            attrs.insert(
                String::from("security_group_ids"),
                serde_json::json!(self.security_group_ids),
            );
        }
        attrs.insert(
            String::from("use_private_ip_for_ssh"),
            serde_json::Value::Bool(self.use_private_ip_for_ssh),
        );
        attrs
    }
}

impl ResourceDecl {
    /// Full hostname-style name including project context.
    #[must_use]
    pub fn full_name(&self, project: &ProjectConfig) -> String {
        format!("{}-{}-{}", project.name, project.environment, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_defaults_layer() {
        let machine = MachineDefaults {
            key_name: Some(String::from("deploy")),
            security_group_ids: vec![String::from("sg-1")],
            ..MachineDefaults::default()
        };
        let attrs = machine.to_attributes();
        assert_eq!(attrs["flavor"], "t2.medium");
        assert_eq!(attrs["key_name"], "deploy");
        assert_eq!(attrs["security_group_ids"], serde_json::json!(["sg-1"]));
        assert!(!attrs.contains_key("image_id"));
    }

    #[test]
    fn test_resource_decl_defaults() {
        let decl: ResourceDecl = serde_yaml::from_str(
            "name: ref-vpc\nkind: network\nattributes:\n  cidr_block: 172.16.0.0/16\n",
        )
        .unwrap();
        assert!(decl.enabled);
        assert!(decl.depends_on.is_empty());
        assert_eq!(decl.kind, ResourceKind::Network);
    }
}
