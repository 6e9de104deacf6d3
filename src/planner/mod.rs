//! Planning and applying changes.
//!
//! This module compares the resource model with observed state, orders the
//! resulting changes, and applies them through a provider.

mod diff;
mod executor;
mod graph;
mod plan;

pub use diff::{
    DEPENDS_ON_FIELD, DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff,
    attribute_details,
};
pub use executor::{
    ApplyOutcome, ApplyReport, ApplyResult, CancellationHandle, PlanExecutor, RetryPolicy,
};
pub use graph::{reverse_order, topological_order};
pub use plan::{ActionType, ChangeAction, Plan, PlannedAction, Planner};
