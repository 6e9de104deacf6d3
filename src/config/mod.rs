//! Configuration module for the provisioner.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of declared values
//! - Ordered merging of attribute layers
//! - Computing attribute hashes for change detection

mod hash;
mod merge;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use merge::{Layer, merge_into, merge_layers};
pub use parser::{CREDENTIALS_ENV, ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    Attributes, DriverKind, ExecutionConfig, HttpDriverConfig, InfraConfig, MachineDefaults,
    ProjectConfig, ProvisioningConfig, ResourceDecl, RetryConfig, StateBackend, StateConfig,
};
pub use validator::{Cidr, ConfigValidator, ValidationError, ValidationResult};
