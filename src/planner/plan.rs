//! Change plans and their construction.
//!
//! A [`Plan`] lists one action per resource: creates, updates and no-ops in
//! dependency order, followed by deletes with dependents first. Every action
//! records the indices of the actions it has to wait for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::error::{ConfigError, ConvergeError, PlanError, Result};
use crate::model::{ResourceKind, ResourceModel, ResourceSpec};
use crate::state::ObservedResource;

use super::diff::{DiffEngine, DiffType};
use super::graph;

/// A change to a single resource.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    /// The resource is not recorded yet.
    Create {
        /// Declared resource.
        spec: ResourceSpec,
    },
    /// The recorded attributes or dependencies differ.
    Update {
        /// Declared resource.
        spec: ResourceSpec,
        /// Current record.
        observed: ObservedResource,
        /// Keys that changed, including `depends_on`.
        changed: BTreeSet<String>,
    },
    /// The resource is recorded but no longer declared.
    Delete {
        /// Current record.
        observed: ObservedResource,
    },
    /// Nothing to do.
    NoOp {
        /// Current record.
        observed: ObservedResource,
    },
}

/// Kinds of plan actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// No operation (for tracking).
    NoOp,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// The change.
    pub action: ChangeAction,
    /// Indices of actions that must complete successfully first.
    pub dependencies: Vec<usize>,
}

/// A complete change plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the model the plan was computed from.
    pub fingerprint: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// Computes plans from a model and an observed snapshot.
#[derive(Debug, Default)]
pub struct Planner {
    diff: DiffEngine,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            diff: DiffEngine::new(),
        }
    }

    /// Plans the changes that converge `observed` toward `model`.
    ///
    /// # Errors
    ///
    /// Returns a cycle error if the dependency graph is cyclic, a conflict
    /// error if an enabled resource depends on a resource scheduled for
    /// deletion, a resolution error if it depends on a disabled resource
    /// that does not exist, and a validation error if a recorded resource
    /// changed kind.
    pub fn plan(
        &self,
        model: &ResourceModel,
        observed: &BTreeMap<String, ObservedResource>,
    ) -> Result<Plan> {
        let order = graph::topological_order(model)?;
        Self::check_dependencies(model, observed)?;

        let mut actions: Vec<PlannedAction> = Vec::with_capacity(order.len());
        let mut index_of: HashMap<String, usize> = HashMap::new();

        for i in order {
            let spec = &model.resources()[i];
            let record = observed.get(&spec.name);

            if let Some(record) = record
                && record.kind != spec.kind
            {
                return Err(ConvergeError::Config(ConfigError::validation(
                    format!(
                        "Resource '{}' is recorded as a {} but declared as a {}; remove it first",
                        spec.name, record.kind, spec.kind
                    ),
                    format!("resources.{}.kind", spec.name),
                )));
            }

            let diff = self.diff.diff_resource(spec, record);
            let action = match (diff.diff_type, record) {
                (DiffType::Update, Some(record)) => ChangeAction::Update {
                    spec: spec.clone(),
                    observed: record.clone(),
                    changed: diff.changed_fields(),
                },
                (DiffType::NoChange, Some(record)) => ChangeAction::NoOp {
                    observed: record.clone(),
                },
                _ => ChangeAction::Create { spec: spec.clone() },
            };

            let dependencies = spec
                .depends_on
                .iter()
                .filter_map(|dep| index_of.get(dep).copied())
                .collect();

            debug!("Planned {} {}", action.action_type(), spec.name);
            index_of.insert(spec.name.clone(), actions.len());
            actions.push(PlannedAction {
                action,
                dependencies,
            });
        }

        let removed: Vec<&str> = observed
            .keys()
            .filter(|name| model.get(name).is_none())
            .map(String::as_str)
            .collect();

        let first_delete = actions.len();
        for name in graph::reverse_order(&removed, observed) {
            let Some(record) = observed.get(&name) else {
                continue;
            };
            index_of.insert(name.clone(), actions.len());
            actions.push(PlannedAction {
                action: ChangeAction::Delete {
                    observed: record.clone(),
                },
                dependencies: Vec::new(),
            });
        }

        Self::link_deletes(&mut actions, first_delete, &index_of, observed);

        let plan = Plan {
            created_at: Utc::now(),
            fingerprint: model.fingerprint().to_string(),
            actions,
        };

        info!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            plan.create_count(),
            plan.update_count(),
            plan.delete_count(),
            plan.noop_count()
        );
        Ok(plan)
    }

    /// Rejects enabled resources that depend on resources outside the model.
    fn check_dependencies(
        model: &ResourceModel,
        observed: &BTreeMap<String, ObservedResource>,
    ) -> Result<()> {
        for spec in model.resources() {
            for dep in &spec.depends_on {
                if model.get(dep).is_some() {
                    continue;
                }
                if observed.contains_key(dep) {
                    return Err(ConvergeError::Plan(PlanError::DependencyConflict {
                        resource: spec.name.clone(),
                        dependency: dep.clone(),
                    }));
                }
                let reason = if model.is_disabled(dep) {
                    "is disabled and does not exist"
                } else {
                    "is not declared"
                };
                return Err(ConvergeError::Plan(PlanError::DependencyResolutionFailed {
                    message: format!("'{}' depends on '{dep}', which {reason}", spec.name),
                }));
            }
        }
        Ok(())
    }

    /// Makes each delete wait for the deletes of its recorded dependents and
    /// for the creates or updates that move kept resources off it.
    fn link_deletes(
        actions: &mut [PlannedAction],
        first_delete: usize,
        index_of: &HashMap<String, usize>,
        observed: &BTreeMap<String, ObservedResource>,
    ) {
        for i in first_delete..actions.len() {
            let target = actions[i].action.name().to_string();
            let mut waits: Vec<usize> = observed
                .values()
                .filter(|r| r.depends_on.iter().any(|d| *d == target))
                .filter_map(|r| index_of.get(&r.name).copied())
                .filter(|&j| {
                    matches!(
                        actions[j].action.action_type(),
                        ActionType::Delete | ActionType::Create | ActionType::Update
                    )
                })
                .collect();
            waits.sort_unstable();
            actions[i].dependencies = waits;
        }
    }
}

impl ChangeAction {
    /// Logical name of the resource.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Create { spec } | Self::Update { spec, .. } => &spec.name,
            Self::Delete { observed } | Self::NoOp { observed } => &observed.name,
        }
    }

    /// Kind of the resource.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Create { spec } | Self::Update { spec, .. } => spec.kind,
            Self::Delete { observed } | Self::NoOp { observed } => observed.kind,
        }
    }

    /// The action type.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::Create { .. } => ActionType::Create,
            Self::Update { .. } => ActionType::Update,
            Self::Delete { .. } => ActionType::Delete,
            Self::NoOp { .. } => ActionType::NoOp,
        }
    }

    fn recorded_id(&self) -> Option<&str> {
        match self {
            Self::Create { .. } => None,
            Self::Update { observed, .. } | Self::Delete { observed } | Self::NoOp { observed } => {
                Some(&observed.provider_id)
            }
        }
    }

    /// Changed keys of an update, empty otherwise.
    #[must_use]
    pub fn changed_keys(&self) -> Vec<&str> {
        match self {
            Self::Update { changed, .. } => changed.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

impl Plan {
    /// An empty plan for a model fingerprint.
    #[must_use]
    pub fn empty(fingerprint: &str) -> Self {
        Self {
            created_at: Utc::now(),
            fingerprint: fingerprint.to_string(),
            actions: Vec::new(),
        }
    }

    /// Returns true if every action is a no-op.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.action.action_type() == ActionType::NoOp)
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action.action_type() == action_type)
            .count()
    }

    /// Returns the number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Returns the number of update actions.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ActionType::Update)
    }

    /// Returns the number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }

    /// Returns the number of no-op actions.
    #[must_use]
    pub fn noop_count(&self) -> usize {
        self.count(ActionType::NoOp)
    }

    /// Actions that change something.
    #[must_use]
    pub fn changes(&self) -> Vec<&PlannedAction> {
        self.actions
            .iter()
            .filter(|a| a.action.action_type() != ActionType::NoOp)
            .collect()
    }

    /// Returns true if both plans make the same calls in the same order.
    ///
    /// Used to detect state that changed between planning and applying.
    #[must_use]
    pub fn same_changes(&self, other: &Self) -> bool {
        self.actions.len() == other.actions.len()
            && self.actions.iter().zip(&other.actions).all(|(a, b)| {
                a.action.action_type() == b.action.action_type()
                    && a.action.name() == b.action.name()
                    && a.action.recorded_id() == b.action.recorded_id()
                    && a.action.changed_keys() == b.action.changed_keys()
                    && a.dependencies == b.dependencies
            })
    }

    /// Position of the action for a logical name.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.action.name() == name)
    }
}

impl ActionType {
    /// Single-character marker used in plan listings.
    #[must_use]
    pub const fn marker(self) -> char {
        match self {
            Self::Create => '+',
            Self::Update => '~',
            Self::Delete => '-',
            Self::NoOp => ' ',
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action_type = self.action.action_type();
        write!(
            f,
            "{} {} {}",
            action_type.marker(),
            self.action.kind(),
            self.action.name()
        )?;
        let changed = self.action.changed_keys();
        if !changed.is_empty() {
            write!(f, " ({})", changed.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            self.create_count(),
            self.update_count(),
            self.delete_count(),
            self.noop_count()
        )?;
        for action in self.changes() {
            writeln!(f, "  {action}")?;
        }
        Ok(())
    }
}
