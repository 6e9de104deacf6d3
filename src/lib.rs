// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Infra Converge
//!
//! A declarative, idempotent provisioner for cloud network and compute
//! resources.
//!
//! ## Overview
//!
//! You describe the infrastructure you want (networks, subnets, route
//! tables, ACLs, key pairs, compute instances) in a YAML declaration.
//! Converge compares it with the last-applied state, computes a
//! dependency-ordered change plan, and applies it through a provider,
//! recording every success so that the next run picks up where this one
//! stopped.
//!
//! ## Architecture
//!
//! 1. **Declaration**: `converge.yaml`, layered into a validated model
//! 2. **Observed state**: the last-applied records in the state store
//! 3. **Planner**: orders creates, updates and deletes by dependency
//! 4. **Executor**: applies the plan with bounded parallelism and retries
//!
//! ## Modules
//!
//! - [`config`]: Declaration parsing, layering and validation
//! - [`model`]: Resource kinds and the validated resource model
//! - [`planner`]: Diffing, planning and plan execution
//! - [`provider`]: Provider boundary and drivers
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Snapshot, refresh, plan, apply and drift checks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: ref
//!
//! resources:
//!   - name: vpc1
//!     kind: network
//!     attributes: { cidr_block: 10.0.0.0/16 }
//!   - name: sub1
//!     kind: subnet
//!     attributes: { vpc: vpc1, cidr_block: 10.0.1.0/24 }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use error::{ConvergeError, Result};
pub use model::{ResourceKind, ResourceModel, ResourceSpec};
pub use planner::{ApplyReport, Plan, PlanExecutor, Planner};
pub use provider::{CloudProvider, MemoryProvider, build_provider};
pub use reconciler::{DriftReport, Reconciler};
pub use state::{LocalStateStore, ObservedResource, S3StateStore, StateStore};
