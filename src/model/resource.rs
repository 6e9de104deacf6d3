//! Declared resources and the validated resource model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::config::{
    Attributes, ConfigHasher, ConfigValidator, InfraConfig, Layer, ResourceDecl, merge_into,
    merge_layers,
};
use crate::error::{ConfigError, ConvergeError, Result};

use super::ResourceKind;

/// A declared resource with its effective attributes.
///
/// Built once per plan cycle by [`ResourceModel::load`] and never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Effective attributes after layering.
    pub attributes: Attributes,
    /// Dependencies by logical name, explicit entries first.
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    /// Reference attributes present on this resource, paired with the name
    /// they point at.
    pub fn references(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.kind.references().iter().filter_map(|(attr, _)| {
            self.attributes
                .get(*attr)
                .and_then(serde_json::Value::as_str)
                .map(|target| (*attr, target))
        })
    }
}

/// The validated set of declared resources.
#[derive(Debug, Clone)]
pub struct ResourceModel {
    /// Enabled resources in declaration order.
    resources: Vec<ResourceSpec>,
    /// Declaration index by logical name.
    index: HashMap<String, usize>,
    /// Names declared with `enabled: false`.
    disabled: BTreeSet<String>,
    /// Hash over every enabled resource.
    fingerprint: String,
}

impl ResourceModel {
    /// Loads and validates the resource model from a declaration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a name is duplicated, a dependency does
    /// not resolve, a resource depends on itself, a required attribute is
    /// missing after layering, or a reference attribute is malformed.
    pub fn load(config: &InfraConfig) -> Result<Self> {
        info!(
            "Loading resource model for {} ({} declarations)",
            config.qualified_name(),
            config.resources.len()
        );

        let declared = check_declarations(&config.resources)?;
        let validation = ConfigValidator::new().validate(config)?;
        for warning in &validation.warnings {
            debug!("Declaration warning: {}", warning);
        }

        let mut resources = Vec::new();
        let mut disabled = BTreeSet::new();

        for decl in &config.resources {
            if !decl.enabled {
                debug!("Resource {} is disabled", decl.name);
                disabled.insert(decl.name.clone());
                continue;
            }
            resources.push(build_spec(config, decl, &declared)?);
        }

        Ok(Self::from_parts(resources, disabled))
    }

    /// An empty model, used to tear down everything in the store.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), BTreeSet::new())
    }

    fn from_parts(resources: Vec<ResourceSpec>, disabled: BTreeSet<String>) -> Self {
        let index = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        let mut model = Self {
            resources,
            index,
            disabled,
            fingerprint: String::new(),
        };
        model.fingerprint = ConfigHasher::new().hash_model(&model);
        model
    }

    /// Enabled resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    /// Adjacency mapping from each enabled resource to its dependencies.
    #[must_use]
    pub fn dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        self.resources
            .iter()
            .map(|r| (r.name.clone(), r.depends_on.clone()))
            .collect()
    }

    /// Looks up an enabled resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.index.get(name).map(|&i| &self.resources[i])
    }

    /// Declaration index of an enabled resource.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns true if the resource is declared but disabled.
    #[must_use]
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    /// Names of disabled resources.
    #[must_use]
    pub const fn disabled(&self) -> &BTreeSet<String> {
        &self.disabled
    }

    /// Fingerprint of the enabled resources.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Number of enabled resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resource is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Checks names and explicit dependencies, returning the kind of every
/// declared resource.
fn check_declarations(decls: &[ResourceDecl]) -> Result<HashMap<&str, ResourceKind>> {
    let mut declared = HashMap::new();
    for decl in decls {
        if declared.insert(decl.name.as_str(), decl.kind).is_some() {
            return Err(ConvergeError::Config(ConfigError::DuplicateName {
                resource_type: decl.kind.to_string(),
                name: decl.name.clone(),
            }));
        }
    }

    for decl in decls {
        for dep in &decl.depends_on {
            if *dep == decl.name {
                return Err(ConvergeError::Config(ConfigError::validation(
                    format!("Resource '{}' cannot depend on itself", decl.name),
                    format!("resources.{}.depends_on", decl.name),
                )));
            }
            if !declared.contains_key(dep.as_str()) {
                return Err(ConvergeError::Config(ConfigError::UnknownDependency {
                    resource: decl.name.clone(),
                    dependency: dep.clone(),
                }));
            }
        }
    }

    Ok(declared)
}

/// The attributes of a declaration after layering base defaults, provider
/// defaults and its own overrides.
#[must_use]
pub fn effective_attributes(config: &InfraConfig, decl: &ResourceDecl) -> Attributes {
    let additive = decl.kind.additive_keys();

    let mut base = decl.kind.builtin_defaults();
    if let Some(section) = config.defaults.get(&decl.kind) {
        merge_into(&mut base, section, additive);
    }
    let provider = provider_layer(config, decl);

    merge_layers(
        &[
            (Layer::Base, &base),
            (Layer::Provider, &provider),
            (Layer::Resource, &decl.attributes),
        ],
        additive,
    )
}

/// Checks required and reference attributes, and folds references into the
/// dependency list.
fn build_spec(
    config: &InfraConfig,
    decl: &ResourceDecl,
    declared: &HashMap<&str, ResourceKind>,
) -> Result<ResourceSpec> {
    let kind = decl.kind;
    let attributes = effective_attributes(config, decl);

    for attribute in kind.required_attributes() {
        if attributes.get(*attribute).is_none_or(serde_json::Value::is_null) {
            return Err(ConvergeError::Config(ConfigError::MissingAttribute {
                resource: decl.name.clone(),
                kind: kind.to_string(),
                attribute: (*attribute).to_string(),
            }));
        }
    }

    let mut depends_on: Vec<String> = Vec::with_capacity(decl.depends_on.len());
    for dep in &decl.depends_on {
        if !depends_on.contains(dep) {
            depends_on.push(dep.clone());
        }
    }

    for (attribute, expected) in kind.references() {
        let Some(value) = attributes.get(*attribute) else {
            continue;
        };
        let field = format!("resources.{}.attributes.{attribute}", decl.name);
        let Some(target) = value.as_str() else {
            return Err(ConvergeError::Config(ConfigError::validation(
                format!("Reference '{attribute}' must be a resource name, got {value}"),
                field,
            )));
        };
        match declared.get(target) {
            None => {
                return Err(ConvergeError::Config(ConfigError::UnknownDependency {
                    resource: decl.name.clone(),
                    dependency: target.to_string(),
                }));
            }
            Some(actual) if actual != expected => {
                return Err(ConvergeError::Config(ConfigError::validation(
                    format!(
                        "Reference '{attribute}' of '{}' must name a {expected}, but '{target}' is a {actual}",
                        decl.name
                    ),
                    field,
                )));
            }
            Some(_) => {}
        }
        if target == decl.name {
            return Err(ConvergeError::Config(ConfigError::validation(
                format!("Resource '{}' cannot depend on itself", decl.name),
                field,
            )));
        }
        if !depends_on.iter().any(|d| d == target) {
            depends_on.push(target.to_string());
        }
    }

    Ok(ResourceSpec {
        name: decl.name.clone(),
        kind,
        attributes,
        depends_on,
    })
}

/// Defaults contributed by the provisioning and machine sections.
///
/// Every resource is tagged with its project, environment, kind and name;
/// declared tags merge over these.
fn provider_layer(config: &InfraConfig, decl: &ResourceDecl) -> Attributes {
    let mut attrs = Attributes::new();
    match decl.kind {
        ResourceKind::Subnet => {
            if let Some(zone) = &config.provisioning.zone {
                attrs.insert(
                    String::from("availability_zone"),
                    serde_json::Value::String(zone.clone()),
                );
            }
        }
        ResourceKind::ComputeInstance => {
            attrs = config.machine.to_attributes();
            attrs.insert(
                String::from("recipes"),
                serde_json::json!(config.provisioning.common_recipes),
            );
            attrs.insert(
                String::from("hostname"),
                serde_json::Value::String(decl.full_name(&config.project)),
            );
        }
        _ => {}
    }
    attrs.insert(
        String::from("tags"),
        serde_json::json!({
            "project": config.project.name,
            "environment": config.project.environment,
            "kind": decl.kind,
            "name": decl.name,
        }),
    );
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    fn load(yaml: &str) -> Result<ResourceModel> {
        let config = ConfigParser::new().parse_yaml(yaml, None)?;
        ResourceModel::load(&config)
    }

    const REF_VPC: &str = r"
project:
  name: ref
provisioning:
  zone: us-west-2b
  common_recipes: [base]
machine:
  image_id: ami-123
  security_group_ids: [sg-default]
defaults:
  subnet:
    map_public_ip_on_launch: true
resources:
  - name: ref-vpc
    kind: network
    attributes: { cidr_block: 172.16.0.0/16 }
  - name: ref-main-route-table
    kind: route_table
    attributes: { vpc: ref-vpc }
  - name: ref-public-subnet
    kind: subnet
    depends_on: [ref-main-route-table]
    attributes:
      vpc: ref-vpc
      cidr_block: 172.16.100.0/24
      route_table: ref-main-route-table
  - name: ref-ssh-key
    kind: key_pair
  - name: sql-server
    kind: compute_instance
    attributes:
      subnet: ref-public-subnet
      key_pair: ref-ssh-key
      recipes: [sql]
      security_group_ids: [sg-sql]
";

    #[test]
    fn test_load_reference_model() {
        let model = load(REF_VPC).unwrap();
        assert_eq!(model.len(), 5);
        assert_eq!(model.resources()[0].name, "ref-vpc");
        assert_eq!(model.fingerprint().len(), 64);
    }

    #[test]
    fn test_references_become_dependencies() {
        let model = load(REF_VPC).unwrap();
        let subnet = model.get("ref-public-subnet").unwrap();
        assert_eq!(subnet.depends_on, vec!["ref-main-route-table", "ref-vpc"]);

        let graph = model.dependency_graph();
        assert_eq!(graph["sql-server"], vec!["ref-public-subnet", "ref-ssh-key"]);
        assert!(graph["ref-vpc"].is_empty());
    }

    #[test]
    fn test_attribute_layering() {
        let model = load(REF_VPC).unwrap();

        let subnet = model.get("ref-public-subnet").unwrap();
        assert_eq!(subnet.attributes["map_public_ip_on_launch"], true);
        assert_eq!(subnet.attributes["availability_zone"], "us-west-2b");

        let server = model.get("sql-server").unwrap();
        assert_eq!(server.attributes["flavor"], "t2.medium");
        assert_eq!(server.attributes["recipes"], json!(["base", "sql"]));
        assert_eq!(
            server.attributes["security_group_ids"],
            json!(["sg-default", "sg-sql"])
        );
        assert_eq!(server.attributes["hostname"], "ref-dev-sql-server");
    }

    #[test]
    fn test_defaults_section_merges_nested_values() {
        let model = load(
            r"
project:
  name: ref
defaults:
  key_pair:
    private_key_options: { format: der }
resources:
  - name: ref-ssh-key
    kind: key_pair
",
        )
        .unwrap();

        let options = &model.get("ref-ssh-key").unwrap().attributes["private_key_options"];
        assert_eq!(options["format"], "der");
        assert_eq!(options["type"], "rsa");
        assert_eq!(options["regenerate_if_different"], true);
    }

    #[test]
    fn test_every_resource_is_tagged() {
        let model = load(
            r"
project:
  name: ref
  environment: prod
resources:
  - name: ref-vpc
    kind: network
    attributes:
      cidr_block: 172.16.0.0/16
      tags: { team: data, name: main }
",
        )
        .unwrap();

        let tags = &model.get("ref-vpc").unwrap().attributes["tags"];
        assert_eq!(
            *tags,
            json!({
                "project": "ref",
                "environment": "prod",
                "kind": "network",
                "name": "main",
                "team": "data",
            })
        );

        let key = load(REF_VPC).unwrap();
        assert_eq!(key.get("ref-ssh-key").unwrap().attributes["tags"]["kind"], "key_pair");
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: sub1
    kind: subnet
    depends_on: [vpc9]
    attributes: { vpc: vpc9, cidr_block: 10.0.0.0/24 }
",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::UnknownDependency { .. })
        ));
        assert!(err.is_validation());
    }

    #[test]
    fn test_unknown_reference_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: sub1
    kind: subnet
    attributes: { vpc: vpc9, cidr_block: 10.0.0.0/24 }
",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: vpc1
    kind: network
    attributes: { cidr_block: 10.0.0.0/16 }
  - name: vpc1
    kind: key_pair
",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_self_dependency_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: key1
    kind: key_pair
    depends_on: [key1]
",
        )
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_missing_required_attribute_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: vpc1
    kind: network
",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_reference_to_wrong_kind_fails() {
        let err = load(
            r"
project:
  name: ref
resources:
  - name: key1
    kind: key_pair
  - name: sub1
    kind: subnet
    attributes: { vpc: key1, cidr_block: 10.0.0.0/24 }
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must name a network"));
    }

    #[test]
    fn test_disabled_resources_are_tracked() {
        let model = load(
            r"
project:
  name: ref
resources:
  - name: vpc1
    kind: network
    attributes: { cidr_block: 10.0.0.0/16 }
  - name: key1
    kind: key_pair
    enabled: false
",
        )
        .unwrap();
        assert_eq!(model.len(), 1);
        assert!(model.is_disabled("key1"));
        assert!(model.get("key1").is_none());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = load("project:\n  name: ref\nresources:\n  - { name: vpc1, kind: network, attributes: { cidr_block: 10.0.0.0/16 } }\n").unwrap();
        let b = load("project:\n  name: ref\nresources:\n  - { name: vpc1, kind: network, attributes: { cidr_block: 10.1.0.0/16 } }\n").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(ResourceModel::empty().len(), 0);
    }
}
