//! Declaration validation.
//!
//! This module checks the declaration document before any resource model is
//! built: naming, duplicate logical names, dependency references, backend
//! settings, and the network-level sanity checks (CIDR blocks, ACL rules).

use crate::error::{ConfigError, ConvergeError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::debug;

use super::spec::{Attributes, DriverKind, InfraConfig, ResourceDecl, StateBackend};
use crate::model::{ResourceKind, effective_attributes};

/// Validator for declarations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Serialize)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Declaration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_provisioning(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_execution(config, &mut result);
        Self::validate_resources(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(config: &InfraConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates driver selection and its typed settings.
    fn validate_provisioning(config: &InfraConfig, result: &mut ValidationResult) {
        let provisioning = &config.provisioning;
        if provisioning.driver == DriverKind::Http {
            match &provisioning.http {
                None => result.push_error(
                    "provisioning.http.endpoint",
                    "The http driver requires provisioning.http.endpoint",
                ),
                Some(http) => {
                    if !(http.endpoint.starts_with("http://")
                        || http.endpoint.starts_with("https://"))
                    {
                        result.push_error(
                            "provisioning.http.endpoint",
                            format!("Endpoint must be an http(s) URL: {}", http.endpoint),
                        );
                    }
                    if http.timeout_secs == 0 {
                        result.push_error(
                            "provisioning.http.timeout_secs",
                            "Timeout must be at least 1 second",
                        );
                    }
                }
            }
            if provisioning.credentials.is_none() {
                result
                    .warnings
                    .push(String::from("provisioning.credentials: No credentials configured"));
            }
        }

        if provisioning.zone.is_some() && provisioning.region.is_none() {
            result.warnings.push(String::from(
                "provisioning.zone: Zone is set without a region",
            ));
        }

        let mut seen = HashSet::new();
        for (i, recipe) in provisioning.common_recipes.iter().enumerate() {
            if recipe.is_empty() {
                result.push_error(
                    format!("provisioning.common_recipes[{i}]"),
                    "Recipe names cannot be empty",
                );
            } else if !seen.insert(recipe) {
                result.warnings.push(format!(
                    "provisioning.common_recipes[{i}]: Duplicate recipe '{recipe}'"
                ));
            }
        }
    }

    /// Validates state configuration.
    fn validate_state(config: &InfraConfig, result: &mut ValidationResult) {
        match config.state.backend {
            StateBackend::S3 => {
                if config.state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push_error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                // Local backend is always valid
            }
        }
    }

    /// Validates retry and parallelism settings.
    fn validate_execution(config: &InfraConfig, result: &mut ValidationResult) {
        if config.retry.max_attempts == 0 {
            result.push_error("retry.max_attempts", "At least one attempt is required");
        }
        if config.retry.base_delay_ms > config.retry.max_delay_ms {
            result.push_error(
                "retry.base_delay_ms",
                "Base delay cannot exceed the maximum delay",
            );
        }
        if config.execution.max_parallel == 0 {
            result.push_error("execution.max_parallel", "Parallelism must be at least 1");
        }
    }

    /// Validates all resource declarations.
    ///
    /// Network checks run against the layered attributes, so a bad block in
    /// the `defaults` section is caught as well as a declared one.
    fn validate_resources(config: &InfraConfig, result: &mut ValidationResult) {
        let resources = &config.resources;
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared in configuration"));
            return;
        }

        let declared: HashMap<&str, &ResourceDecl> =
            resources.iter().map(|r| (r.name.as_str(), r)).collect();
        let layered: HashMap<&str, Attributes> = resources
            .iter()
            .map(|r| (r.name.as_str(), effective_attributes(config, r)))
            .collect();
        let mut seen_names = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.push_error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if !is_valid_name(&resource.name) {
                result.push_error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            Self::validate_dependencies(resource, &declared, &prefix, result);

            let Some(attributes) = layered.get(resource.name.as_str()) else {
                continue;
            };
            match resource.kind {
                ResourceKind::Network | ResourceKind::Subnet => {
                    Self::validate_cidr(resource, attributes, &layered, &prefix, result);
                }
                ResourceKind::NetworkAcl => {
                    Self::validate_acl_rules(attributes, &prefix, result);
                }
                _ => {}
            }
        }
    }

    /// Validates explicit dependency lists.
    fn validate_dependencies(
        resource: &ResourceDecl,
        declared: &HashMap<&str, &ResourceDecl>,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (j, dep) in resource.depends_on.iter().enumerate() {
            let field = format!("{prefix}.depends_on[{j}]");
            if *dep == resource.name {
                result.push_error(
                    field,
                    format!("Resource '{}' cannot depend on itself", resource.name),
                );
            } else if !declared.contains_key(dep.as_str()) {
                result.push_error(
                    field,
                    format!(
                        "Resource '{}' depends on undeclared resource '{dep}'",
                        resource.name
                    ),
                );
            } else if !seen.insert(dep) {
                result.warnings.push(format!(
                    "{field}: Dependency '{dep}' is listed more than once"
                ));
            }
        }
    }

    /// Validates CIDR blocks, including subnet containment in its network.
    fn validate_cidr(
        resource: &ResourceDecl,
        attributes: &Attributes,
        layered: &HashMap<&str, Attributes>,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        let Some(value) = attributes.get("cidr_block") else {
            return;
        };
        let field = format!("{prefix}.attributes.cidr_block");

        let Some(block) = value.as_str().and_then(Cidr::parse) else {
            result.push_error(field, format!("Invalid IPv4 CIDR block: {value}"));
            return;
        };

        if resource.kind != ResourceKind::Subnet {
            return;
        }

        let parent = attributes
            .get("vpc")
            .and_then(serde_json::Value::as_str)
            .and_then(|name| layered.get(name))
            .and_then(|network| network.get("cidr_block"))
            .and_then(serde_json::Value::as_str)
            .and_then(Cidr::parse);

        if let Some(parent) = parent
            && !parent.contains(&block)
        {
            result.push_error(
                field,
                format!(
                    "Subnet block {block} of '{}' is outside its network block {parent}",
                    resource.name
                ),
            );
        }
    }

    /// Validates inbound and outbound ACL rule lists.
    fn validate_acl_rules(attributes: &Attributes, prefix: &str, result: &mut ValidationResult) {
        for direction in ["inbound_rules", "outbound_rules"] {
            let Some(rules) = attributes.get(direction) else {
                continue;
            };
            let field = format!("{prefix}.attributes.{direction}");
            let Some(rules) = rules.as_array() else {
                result.push_error(field, "ACL rules must be a list");
                continue;
            };

            let mut numbers = HashSet::new();
            for (k, rule) in rules.iter().enumerate() {
                let rule_field = format!("{field}[{k}]");
                match rule.get("rule_number").and_then(serde_json::Value::as_u64) {
                    Some(number) => {
                        if !numbers.insert(number) {
                            result.push_error(
                                format!("{rule_field}.rule_number"),
                                format!("Duplicate rule number {number} in {direction}"),
                            );
                        }
                    }
                    None => result.push_error(
                        format!("{rule_field}.rule_number"),
                        "Rule number is required",
                    ),
                }

                match rule.get("action").and_then(serde_json::Value::as_str) {
                    Some("allow" | "deny") => {}
                    Some(other) => result.push_error(
                        format!("{rule_field}.action"),
                        format!("Unknown rule action '{other}'. Expected: allow or deny"),
                    ),
                    None => result.push_error(
                        format!("{rule_field}.action"),
                        "Rule action is required",
                    ),
                }
            }
        }
    }
}

/// An IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Network address.
    pub addr: Ipv4Addr,
    /// Prefix length.
    pub prefix: u8,
}

impl Cidr {
    /// Parses a block like `172.16.0.0/16`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        (prefix <= 32).then_some(Self { addr, prefix })
    }

    /// Network mask for the prefix length.
    const fn mask(self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// Whether `other` lies entirely within this block.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix
            && (u32::from(other.addr) & self.mask()) == (u32::from(self.addr) & self.mask())
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub(crate) fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Records an error for a field.
    pub fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> InfraConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("ref-vpc"));
        assert!(is_valid_name("sql-server-1"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Ref-Vpc"));
        assert!(!is_valid_name("1-vpc"));
        assert!(!is_valid_name("ref_vpc"));
        assert!(!is_valid_name("vpc-"));
        assert!(!is_valid_name("ref--vpc"));
    }

    #[test]
    fn test_cidr_containment() {
        let network = Cidr::parse("172.16.0.0/16").unwrap();
        let inside = Cidr::parse("172.16.100.0/24").unwrap();
        let outside = Cidr::parse("10.0.0.0/24").unwrap();
        assert!(network.contains(&inside));
        assert!(!network.contains(&outside));
        assert!(!inside.contains(&network));
        assert!(Cidr::parse("172.16.0.0/33").is_none());
        assert!(Cidr::parse("not-a-cidr").is_none());
    }

    #[test]
    fn test_duplicate_and_unknown_dependencies() {
        let config = parse(
            r"
project:
  name: ref
resources:
  - name: ref-vpc
    kind: network
    attributes: { cidr_block: 172.16.0.0/16 }
  - name: ref-vpc
    kind: network
    attributes: { cidr_block: 172.17.0.0/16 }
  - name: ref-rt
    kind: route_table
    depends_on: [ghost]
    attributes: { vpc: ref-vpc }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate")));
        assert!(result.errors.iter().any(|e| e.message.contains("ghost")));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_self_dependency() {
        let config = parse(
            r"
project:
  name: ref
resources:
  - name: ref-key
    kind: key_pair
    depends_on: [ref-key]
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.message.contains("itself")));
    }

    #[test]
    fn test_subnet_outside_network() {
        let config = parse(
            r"
project:
  name: ref
resources:
  - name: ref-vpc
    kind: network
    attributes: { cidr_block: 172.16.0.0/16 }
  - name: ref-subnet
    kind: subnet
    attributes: { vpc: ref-vpc, cidr_block: 10.0.0.0/24 }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("outside"));
    }

    #[test]
    fn test_defaults_section_blocks_are_checked() {
        let config = parse(
            r"
project:
  name: ref
defaults:
  subnet:
    cidr_block: 10.0.0.0/24
resources:
  - name: ref-vpc
    kind: network
    attributes: { cidr_block: 172.16.0.0/16 }
  - name: ref-subnet
    kind: subnet
    attributes: { vpc: ref-vpc }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "resources[1].attributes.cidr_block");
        assert!(result.errors[0].message.contains("outside"));
    }

    #[test]
    fn test_acl_rules() {
        let config = parse(
            r"
project:
  name: ref
resources:
  - name: ref-acl
    kind: network_acl
    attributes:
      vpc: ref-vpc
      inbound_rules:
        - { rule_number: 100, action: allow, protocol: 6, cidr_block: 0.0.0.0/0 }
        - { rule_number: 100, action: allow, protocol: 6, cidr_block: 0.0.0.0/0 }
      outbound_rules:
        - { rule_number: 100, action: permit }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn test_http_driver_requires_endpoint() {
        let config = parse(
            r"
project:
  name: ref
provisioning:
  driver: http
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "provisioning.http.endpoint"));
    }
}
