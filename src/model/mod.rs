//! Resource model.
//!
//! Turns a declaration into validated, immutable [`ResourceSpec`]s with
//! their effective attributes and dependency edges.

mod kind;
mod resource;

pub use kind::ResourceKind;
pub use resource::{ResourceModel, ResourceSpec, effective_attributes};
