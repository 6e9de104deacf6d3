//! Resource kinds and their per-kind schema.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Attributes;

/// Kinds of infrastructure resources the provisioner manages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual private network.
    Network,
    /// Subnet inside a network.
    Subnet,
    /// Route table attached to a network.
    RouteTable,
    /// Stateless network ACL.
    NetworkAcl,
    /// SSH key pair.
    KeyPair,
    /// Bootstrapped compute instance.
    ComputeInstance,
}

/// Fields every provider may report but which are never declared.
///
/// Keys here are hidden from diffs, so a declared attribute of the same name
/// would never be compared.
const COMMON_COMPUTED: &[&str] = &[
    "arn",
    "owner_id",
    "lifecycle_state",
    "created_time",
    "tags_all",
];

impl ResourceKind {
    /// Attributes that must be present after layering.
    #[must_use]
    pub const fn required_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Network => &["cidr_block"],
            Self::Subnet => &["cidr_block", "vpc"],
            Self::RouteTable | Self::NetworkAcl => &["vpc"],
            Self::KeyPair => &[],
            Self::ComputeInstance => &["flavor", "image_id"],
        }
    }

    /// Attributes whose value is the logical name of another resource.
    ///
    /// At apply time each of these is resolved into `<attribute>_id`, holding
    /// the provider identifier of the referenced resource.
    #[must_use]
    pub const fn references(self) -> &'static [(&'static str, Self)] {
        match self {
            Self::Network | Self::KeyPair => &[],
            Self::Subnet => &[
                ("vpc", Self::Network),
                ("route_table", Self::RouteTable),
                ("network_acl", Self::NetworkAcl),
            ],
            Self::RouteTable | Self::NetworkAcl => &[("vpc", Self::Network)],
            Self::ComputeInstance => &[("subnet", Self::Subnet), ("key_pair", Self::KeyPair)],
        }
    }

    /// List attributes that concatenate across layers instead of replacing.
    #[must_use]
    pub const fn additive_keys(self) -> &'static [&'static str] {
        match self {
            Self::ComputeInstance => &["recipes", "security_group_ids"],
            _ => &[],
        }
    }

    /// Provider-computed fields ignored when comparing attributes.
    #[must_use]
    pub fn computed_fields(self) -> Vec<&'static str> {
        let specific: &[&str] = match self {
            Self::Network => &["main_route_table_id", "default_network_acl_id"],
            Self::Subnet => &["available_ip_address_count"],
            Self::RouteTable => &["associations"],
            Self::NetworkAcl => &["is_default"],
            Self::KeyPair => &["fingerprint"],
            Self::ComputeInstance => &["public_ip", "private_ip", "public_dns"],
        };
        COMMON_COMPUTED.iter().chain(specific).copied().collect()
    }

    /// Whether a key is provider-computed for this kind.
    #[must_use]
    pub fn is_computed(self, key: &str) -> bool {
        COMMON_COMPUTED.contains(&key) || self.computed_fields().contains(&key)
    }

    /// Built-in defaults, the lowest attribute layer.
    #[must_use]
    pub fn builtin_defaults(self) -> Attributes {
        let value = match self {
            Self::Network => json!({
                "instance_tenancy": "default",
                "enable_dns_support": true,
                "enable_dns_hostnames": true,
                "internet_gateway": false,
            }),
            Self::Subnet => json!({ "map_public_ip_on_launch": false }),
            Self::RouteTable => json!({ "routes": {} }),
            Self::NetworkAcl => json!({ "inbound_rules": [], "outbound_rules": [] }),
            Self::KeyPair => json!({
                "private_key_options": {
                    "format": "pem",
                    "type": "rsa",
                    "regenerate_if_different": true,
                },
                "allow_overwrite": true,
            }),
            Self::ComputeInstance => json!({ "recipes": [], "attributes": {} }),
        };
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        }
    }

    /// Short prefix used when minting identifiers.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Network => "vpc",
            Self::Subnet => "subnet",
            Self::RouteTable => "rtb",
            Self::NetworkAcl => "acl",
            Self::KeyPair => "key",
            Self::ComputeInstance => "i",
        }
    }

    /// The wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::RouteTable => "route_table",
            Self::NetworkAcl => "network_acl",
            Self::KeyPair => "key_pair",
            Self::ComputeInstance => "compute_instance",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
