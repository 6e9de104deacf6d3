//! Reconciler tying the model, planner, executor and state store together.
//!
//! One reconciliation cycle takes a snapshot of the store, optionally
//! refreshes it against the provider, plans, and applies under the state
//! lock.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::InfraConfig;
use crate::error::{ConvergeError, ProviderError, Result, StateError};
use crate::model::{ResourceKind, ResourceModel};
use crate::planner::{
    ApplyReport, CancellationHandle, DiffDetail, DiffEngine, Plan, PlanExecutor, Planner,
    ResourceDiff, RetryPolicy, attribute_details,
};
use crate::provider::{CloudProvider, build_provider};
use crate::state::{
    ApplyOperation, LOCK_RENEW_SECS, LockInfo, ObservedResource, StateStore, generate_holder_id,
    open_store,
};

/// Coordinates reconciliation cycles for one declaration.
pub struct Reconciler {
    /// Loaded declaration.
    config: InfraConfig,
    /// Validated resource model.
    model: ResourceModel,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider driver.
    provider: Arc<dyn CloudProvider>,
    /// Planner.
    planner: Planner,
    /// Diff engine for drift reports.
    diff_engine: DiffEngine,
    /// Retry settings for provider calls.
    retry: RetryPolicy,
    /// Maximum provider calls in flight.
    max_parallel: usize,
    /// Cancellation signal for apply.
    cancel: CancellationHandle,
    /// Lock holder identity.
    holder: String,
}

/// Outcome of a refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    /// Snapshot after the refresh.
    #[serde(skip)]
    pub observed: BTreeMap<String, ObservedResource>,
    /// Records rewritten with live values.
    pub updated: Vec<String>,
    /// Records dropped because the provider resource is gone.
    pub dropped: Vec<String>,
}

/// Difference between a record and the live provider view.
#[derive(Debug, Clone, Serialize)]
pub struct LiveDrift {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// The provider no longer knows the resource.
    pub missing: bool,
    /// Recorded keys whose live value differs.
    pub details: Vec<DiffDetail>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Declared changes not yet applied.
    pub pending: Vec<ResourceDiff>,
    /// Recorded resources that changed behind the store's back.
    pub live: Vec<LiveDrift>,
    /// Number of enabled resources in the model.
    pub total_resources: usize,
    /// Number of recorded resources.
    pub observed_count: usize,
}

impl Reconciler {
    /// Creates a reconciler over an explicit store and provider.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the declaration does not load.
    pub fn new(
        config: InfraConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn CloudProvider>,
    ) -> Result<Self> {
        let model = ResourceModel::load(&config)?;
        Ok(Self {
            retry: config.retry.into(),
            max_parallel: config.execution.max_parallel,
            config,
            model,
            store,
            provider,
            planner: Planner::new(),
            diff_engine: DiffEngine::new(),
            cancel: CancellationHandle::new(),
            holder: generate_holder_id(),
        })
    }

    /// Opens the configured store and provider driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid, or the store or the
    /// provider cannot be opened.
    pub async fn connect(config: InfraConfig, base_dir: &Path) -> Result<Self> {
        let store = open_store(&config.state, base_dir).await?;
        let recorded = store.all().await?;
        let provider = build_provider(&config.provisioning, &recorded)?;
        info!(
            "Using {} provider with {} state",
            provider.name(),
            store.backend_type()
        );
        Self::new(config, store, provider)
    }

    /// Overrides the number of concurrent provider calls.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Sets the cancellation handle used by apply.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// The loaded declaration.
    #[must_use]
    pub const fn config(&self) -> &InfraConfig {
        &self.config
    }

    /// The validated resource model.
    #[must_use]
    pub const fn model(&self) -> &ResourceModel {
        &self.model
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Reads every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns a state error if the store cannot be read.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, ObservedResource>> {
        self.store.all().await
    }

    /// Re-reads every recorded resource from the provider.
    ///
    /// Recorded keys take their live value and keys the provider no longer
    /// reports are dropped; extra live keys are ignored. Records whose
    /// resource is gone are removed from the store.
    ///
    /// # Errors
    ///
    /// Returns a provider error if a describe call fails for any reason
    /// other than not-found, or a state error.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        let result = self.refresh_locked().await;
        self.release(&lock).await;
        result
    }

    async fn refresh_locked(&self) -> Result<RefreshReport> {
        let recorded = self.store.all().await?;
        info!("Refreshing {} recorded resources", recorded.len());

        let mut observed = BTreeMap::new();
        let mut updated = Vec::new();
        let mut dropped = Vec::new();

        for (name, record) in recorded {
            let live = match self
                .provider
                .describe_resource(&record.provider_id, record.kind)
                .await
            {
                Ok(live) => live,
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{} ({}) no longer exists", name, record.provider_id);
                    self.store.delete(&name).await?;
                    dropped.push(name);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let refreshed = refreshed_record(&record, live);
            if refreshed.attributes == record.attributes && refreshed.computed == record.computed {
                debug!("{} is unchanged", name);
                observed.insert(name, record);
                continue;
            }

            debug!("{} refreshed from provider", name);
            self.store.put(refreshed.clone()).await?;
            updated.push(name.clone());
            observed.insert(name, refreshed);
        }

        Ok(RefreshReport {
            observed,
            updated,
            dropped,
        })
    }

    /// Plans against the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns a plan error (cycle, conflict, unresolved dependency) or a
    /// state error.
    pub async fn plan(&self) -> Result<Plan> {
        let observed = self.snapshot().await?;
        self.plan_against(&observed)
    }

    /// Plans against a given snapshot.
    ///
    /// # Errors
    ///
    /// Returns a plan error.
    pub fn plan_against(&self, observed: &BTreeMap<String, ObservedResource>) -> Result<Plan> {
        self.planner.plan(&self.model, observed)
    }

    /// Plans the removal of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns a state error if the store cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let observed = self.snapshot().await?;
        self.planner.plan(&ResourceModel::empty(), &observed)
    }

    /// Applies a plan under the state lock.
    ///
    /// The plan is recomputed once the lock is held; if recorded state moved
    /// in the meantime nothing is applied.
    ///
    /// # Errors
    ///
    /// Returns a state error if the lock cannot be taken, the plan is stale,
    /// or the store cannot be written.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        self.run(plan, ApplyOperation::Apply).await
    }

    /// Applies a destroy plan under the state lock.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::apply`].
    pub async fn destroy(&self, plan: &Plan) -> Result<ApplyReport> {
        self.run(plan, ApplyOperation::Destroy).await
    }

    async fn run(&self, plan: &Plan, operation: ApplyOperation) -> Result<ApplyReport> {
        if plan.is_converged() {
            info!("No changes required - state is converged");
        }

        let lock = self.store.acquire_lock(&self.holder).await?;
        let keep_alive = self.keep_alive(lock.clone());
        let result = self.run_locked(plan, operation).await;
        keep_alive.abort();
        self.release(&lock).await;
        result
    }

    async fn run_locked(&self, plan: &Plan, operation: ApplyOperation) -> Result<ApplyReport> {
        let observed = self.snapshot().await?;
        let current = match operation {
            ApplyOperation::Apply => self.planner.plan(&self.model, &observed)?,
            ApplyOperation::Destroy => self.planner.plan(&ResourceModel::empty(), &observed)?,
        };
        if !plan.same_changes(&current) {
            warn!("Recorded state changed since the plan was computed");
            return Err(ConvergeError::State(StateError::StalePlan));
        }

        let executor = PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_retry(self.retry)
            .with_max_parallel(self.max_parallel)
            .with_cancellation(self.cancel.clone())
            .with_operation(operation);

        executor.apply(plan).await
    }

    /// Renews the state lock until aborted. Losing the lock cancels the
    /// apply cycle.
    fn keep_alive(&self, lock: LockInfo) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut current = lock;
            loop {
                tokio::time::sleep(Duration::from_secs(LOCK_RENEW_SECS)).await;
                match store.renew_lock(&current).await {
                    Ok(renewed) => current = renewed,
                    Err(ConvergeError::State(StateError::LockLost { lock_id })) => {
                        error!("State lock {} was lost, cancelling apply", lock_id);
                        cancel.cancel();
                        return;
                    }
                    Err(e) => warn!("Failed to renew state lock {}: {}", current.lock_id, e),
                }
            }
        })
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {}", lock.lock_id, e);
        }
    }

    /// Checks for drift without applying changes.
    ///
    /// Reports declared changes that a plan would make and recorded
    /// resources whose live attributes no longer match the record.
    ///
    /// # Errors
    ///
    /// Returns a state error, or a provider error other than not-found.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.qualified_name());

        let observed = self.snapshot().await?;
        let diff = self.diff_engine.compute_diff(&self.model, &observed);
        let pending: Vec<ResourceDiff> = diff.actionable_diffs().into_iter().cloned().collect();

        let mut live = Vec::new();
        for record in observed.values() {
            match self
                .provider
                .describe_resource(&record.provider_id, record.kind)
                .await
            {
                Ok(attrs) => {
                    let view = live_view(&record.attributes, &attrs);
                    let details = attribute_details(record.kind, &record.attributes, &view);
                    if !details.is_empty() {
                        live.push(LiveDrift {
                            name: record.name.clone(),
                            kind: record.kind,
                            missing: false,
                            details,
                        });
                    }
                }
                Err(ProviderError::NotFound { .. }) => live.push(LiveDrift {
                    name: record.name.clone(),
                    kind: record.kind,
                    missing: true,
                    details: Vec::new(),
                }),
                Err(e) => return Err(ConvergeError::Provider(e)),
            }
        }

        Ok(DriftReport {
            pending,
            live,
            total_resources: self.model.len(),
            observed_count: observed.len(),
        })
    }
}

/// Recorded keys with their live values; keys the provider omits are dropped.
fn live_view(
    recorded: &crate::config::Attributes,
    live: &crate::config::Attributes,
) -> crate::config::Attributes {
    recorded
        .keys()
        .filter_map(|key| live.get(key).map(|v| (key.clone(), v.clone())))
        .collect()
}

/// A record rewritten with live attributes and computed fields.
fn refreshed_record(record: &ObservedResource, live: crate::config::Attributes) -> ObservedResource {
    let attributes = live_view(&record.attributes, &live);
    let computed = live
        .into_iter()
        .filter(|(key, _)| record.kind.is_computed(key))
        .collect();

    let mut refreshed = ObservedResource::new(
        &record.name,
        record.kind,
        &record.provider_id,
        attributes,
        record.depends_on.clone(),
    )
    .with_computed(computed);
    refreshed.created_at = record.created_at;
    refreshed.applied_at = record.applied_at;
    refreshed
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.qualified_name())
            .field("resources", &self.model.len())
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl DriftReport {
    /// Returns true if anything drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.pending.is_empty() || !self.live.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }

        if !self.pending.is_empty() {
            writeln!(f, "Pending changes:")?;
            for diff in &self.pending {
                writeln!(f, "  {diff}")?;
            }
        }
        if !self.live.is_empty() {
            writeln!(f, "Changed outside converge:")?;
            for drift in &self.live {
                if drift.missing {
                    writeln!(f, "  {} {} (missing)", drift.kind, drift.name)?;
                } else {
                    let fields: Vec<&str> = drift.details.iter().map(|d| d.field.as_str()).collect();
                    writeln!(f, "  {} {} ({})", drift.kind, drift.name, fields.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::provider::MemoryProvider;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    const VPC1_SUB1: &str = r"
project:
  name: ref
resources:
  - name: vpc1
    kind: network
    attributes: { cidr_block: 10.0.0.0/16 }
  - name: sub1
    kind: subnet
    depends_on: [vpc1]
    attributes: { vpc: vpc1, cidr_block: 10.0.1.0/24 }
";

    fn reconciler(yaml: &str, dir: &TempDir, provider: Arc<MemoryProvider>) -> Reconciler {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        Reconciler::new(config, store, provider).unwrap()
    }

    #[tokio::test]
    async fn test_plan_apply_replan_converges() {
        let dir = TempDir::new().unwrap();
        let r = reconciler(VPC1_SUB1, &dir, Arc::new(MemoryProvider::new()));

        let plan = r.plan().await.unwrap();
        assert_eq!(plan.create_count(), 2);
        let report = r.apply(&plan).await.unwrap();
        assert!(report.is_success());

        assert!(r.plan().await.unwrap().is_converged());
        assert!(r.check_drift().await.unwrap().is_converged());
        // The lock is released after apply.
        assert!(!r.store().is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_resources() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let r = reconciler(VPC1_SUB1, &dir, provider.clone());
        r.apply(&r.plan().await.unwrap()).await.unwrap();

        let sub1 = r.store().get("sub1").await.unwrap().unwrap();
        assert!(provider.remove_out_of_band(&sub1.provider_id).await);

        let drift = r.check_drift().await.unwrap();
        assert!(drift.live.iter().any(|d| d.name == "sub1" && d.missing));

        let refreshed = r.refresh().await.unwrap();
        assert_eq!(refreshed.dropped, vec!["sub1"]);
        assert!(!refreshed.observed.contains_key("sub1"));
        assert!(r.store().get("sub1").await.unwrap().is_none());

        let plan = r.plan_against(&refreshed.observed).unwrap();
        assert_eq!(plan.create_count(), 1);
        assert_eq!(plan.noop_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_keeps_matching_records() {
        let dir = TempDir::new().unwrap();
        let r = reconciler(VPC1_SUB1, &dir, Arc::new(MemoryProvider::new()));
        r.apply(&r.plan().await.unwrap()).await.unwrap();

        let refreshed = r.refresh().await.unwrap();
        assert!(refreshed.updated.is_empty());
        assert!(refreshed.dropped.is_empty());
        assert_eq!(refreshed.observed.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let r = reconciler(VPC1_SUB1, &dir, provider.clone());
        r.apply(&r.plan().await.unwrap()).await.unwrap();

        let plan = r.plan_destroy().await.unwrap();
        assert_eq!(plan.delete_count(), 2);
        let report = r.destroy(&plan).await.unwrap();
        assert_eq!(report.deleted, 2);
        assert!(r.snapshot().await.unwrap().is_empty());
        assert_eq!(provider.resource_count().await, 0);

        let history = r.store().history().await.unwrap();
        assert_eq!(history.last().map(|h| h.operation), Some(ApplyOperation::Destroy));
    }

    #[tokio::test]
    async fn test_apply_fails_while_locked_by_other() {
        let dir = TempDir::new().unwrap();
        let r = reconciler(VPC1_SUB1, &dir, Arc::new(MemoryProvider::new()));
        let other = LocalStateStore::with_base_dir(dir.path());
        other.acquire_lock("someone-else").await.unwrap();

        let plan = r.plan().await.unwrap();
        let err = r.apply(&plan).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(_)));
    }

    #[tokio::test]
    async fn test_apply_rejects_plan_made_stale_by_another_writer() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let first = reconciler(VPC1_SUB1, &dir, provider.clone());
        let second = reconciler(VPC1_SUB1, &dir, provider.clone());

        let plan = first.plan().await.unwrap();
        second.apply(&second.plan().await.unwrap()).await.unwrap();

        let err = first.apply(&plan).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::StalePlan)));
        assert_eq!(err.exit_code(), crate::error::EXIT_STATE);
        assert_eq!(provider.call_count("vpc1").await, 1);
        assert!(!first.store().is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_seeds_memory_provider_from_state() {
        let dir = TempDir::new().unwrap();
        let config = ConfigParser::new().parse_yaml(VPC1_SUB1, None).unwrap();

        let first = Reconciler::connect(config.clone(), dir.path()).await.unwrap();
        first.apply(&first.plan().await.unwrap()).await.unwrap();

        // A second process sees the same simulated plane.
        let second = Reconciler::connect(config, dir.path()).await.unwrap();
        assert!(second.check_drift().await.unwrap().is_converged());
    }
}
