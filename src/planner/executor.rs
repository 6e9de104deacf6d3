//! Plan executor for applying change plans.
//!
//! Actions run through a dependency-count gate: an action is dispatched once
//! every action it waits for has succeeded and its state record is written.
//! Up to `max_parallel` provider calls are in flight at once.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Attributes, RetryConfig};
use crate::error::{
    ApplyError, ConvergeError, EXIT_PARTIAL_FAILURE, EXIT_SUCCESS, ProviderError, Result,
};
use crate::model::{ResourceKind, ResourceSpec};
use crate::provider::{CloudProvider, NAME_ATTRIBUTE, Operation, ProviderResult};
use crate::state::{ApplyHistoryEntry, ApplyOperation, ObservedResource, StateStore};

use super::plan::{ActionType, ChangeAction, Plan};

/// Backoff settings for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a computed delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    ///
    /// A provider-supplied `retry-after` wins when it is longer.
    #[must_use]
    pub fn delay(&self, attempt: u32, error: &ProviderError) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match error {
            ProviderError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs))
            }
            _ => backoff,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Cooperative cancellation for an apply cycle.
///
/// Cancelling stops dispatch of actions that have not started; calls already
/// in flight finish and are recorded.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    /// Creates a handle that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Final outcome of one action.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Created or updated and recorded.
    Applied(ObservedResource),
    /// Deleted and removed from the store.
    Deleted,
    /// Nothing to do.
    Unchanged,
    /// The provider call or its preparation failed.
    Failed {
        /// Error description.
        error: String,
        /// Whether the provider resource was left in a known state.
        consistent: bool,
    },
    /// Not attempted because a dependency failed.
    Skipped {
        /// The failed resource this action waited on.
        blocked_by: String,
    },
    /// Not attempted because the cycle was cancelled or aborted.
    Cancelled,
}

/// Result of one planned action.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned action type.
    pub action: ActionType,
    /// What happened.
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
    /// Provider calls made, including retries.
    pub attempts: u32,
}

impl ApplyResult {
    /// Returns true if the resource reached its declared state.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            ApplyOutcome::Applied(_) | ApplyOutcome::Deleted | ApplyOutcome::Unchanged
        )
    }
}

/// Result of applying a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// One result per planned action, in plan order.
    pub results: Vec<ApplyResult>,
    /// Resources created or updated.
    pub applied: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
    /// Actions that failed.
    pub failed: usize,
    /// Actions skipped behind a failure.
    pub skipped: usize,
    /// Actions not started because of cancellation.
    pub cancelled: usize,
}

impl ApplyReport {
    fn from_results(results: Vec<ApplyResult>) -> Self {
        let count = |f: fn(&ApplyOutcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
        Self {
            applied: count(|o| matches!(o, ApplyOutcome::Applied(_))),
            deleted: count(|o| matches!(o, ApplyOutcome::Deleted)),
            unchanged: count(|o| matches!(o, ApplyOutcome::Unchanged)),
            failed: count(|o| matches!(o, ApplyOutcome::Failed { .. })),
            skipped: count(|o| matches!(o, ApplyOutcome::Skipped { .. })),
            cancelled: count(|o| matches!(o, ApplyOutcome::Cancelled)),
            results,
        }
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }

    /// Names of resources left unreconciled.
    #[must_use]
    pub fn unreconciled(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Looks up the result for a logical name.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&ApplyResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Process exit code for this report.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL_FAILURE
        }
    }
}

/// A provider call ready to run.
#[derive(Debug)]
enum Job {
    Create {
        kind: ResourceKind,
        attributes: Attributes,
    },
    Update {
        provider_id: String,
        kind: ResourceKind,
        attributes: Attributes,
    },
    Delete {
        provider_id: String,
        kind: ResourceKind,
    },
}

impl Job {
    const fn kind(&self) -> ResourceKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
        }
    }

    const fn operation(&self) -> Operation {
        match self {
            Self::Create { .. } => Operation::Create,
            Self::Update { .. } => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
        }
    }
}

/// What a successful provider call produced.
#[derive(Debug)]
enum Effect {
    Written {
        provider_id: String,
        computed: Attributes,
    },
    Deleted,
}

/// A finished task: action index, attempts and the call result.
type TaskOutput = (usize, u32, ProviderResult<Effect>);

/// Executor for change plans.
pub struct PlanExecutor {
    /// Provider driver.
    provider: Arc<dyn CloudProvider>,
    /// State store mutated as actions succeed.
    store: Arc<dyn StateStore>,
    /// Retry settings.
    retry: RetryPolicy,
    /// Maximum provider calls in flight.
    max_parallel: usize,
    /// Cancellation signal.
    cancel: CancellationHandle,
    /// Operation recorded in history.
    operation: ApplyOperation,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            max_parallel: 1,
            cancel: CancellationHandle::new(),
            operation: ApplyOperation::Apply,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of concurrent provider calls; zero is treated as one.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Sets the cancellation handle.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the operation recorded in history.
    #[must_use]
    pub const fn with_operation(mut self, operation: ApplyOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Applies a plan.
    ///
    /// Provider failures are reported per action; they do not fail the
    /// cycle.
    ///
    /// # Errors
    ///
    /// Returns a state error if the store cannot be written. Dispatch stops,
    /// in-flight calls are drained, and mutations already made stay in place.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        info!(
            "Applying plan with {} actions (max {} in flight)",
            plan.action_count(),
            self.max_parallel
        );

        let n = plan.actions.len();
        let mut outcomes: Vec<Option<(ApplyOutcome, u32)>> = vec![None; n];
        let mut waiting: Vec<usize> = plan.actions.iter().map(|a| a.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, action) in plan.actions.iter().enumerate() {
            for &dep in &action.dependencies {
                dependents[dep].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut fatal: Option<ConvergeError> = None;
        let mut cancel_seen = false;

        loop {
            while fatal.is_none() && !self.cancel.is_cancelled() && tasks.len() < self.max_parallel
            {
                let Some(idx) = ready.pop_first() else {
                    break;
                };
                let action = &plan.actions[idx].action;

                let job = match self.prepare(action).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        outcomes[idx] = Some((ApplyOutcome::Unchanged, 0));
                        release(idx, &dependents, &mut waiting, &mut ready);
                        continue;
                    }
                    Err(ConvergeError::State(e)) => {
                        error!("State store read failed: {}", e);
                        fatal = Some(ConvergeError::State(e));
                        break;
                    }
                    Err(e) => {
                        warn!("Cannot apply {}: {}", action.name(), e);
                        outcomes[idx] = Some((
                            ApplyOutcome::Failed {
                                error: e.to_string(),
                                consistent: true,
                            },
                            0,
                        ));
                        skip_dependents(plan, idx, &dependents, &mut outcomes);
                        continue;
                    }
                };

                debug!("Dispatching {} {}", action.action_type(), action.name());
                let provider = Arc::clone(&self.provider);
                let retry = self.retry;
                let name = action.name().to_string();
                tasks.spawn(async move {
                    let (attempts, result) = run_job(provider.as_ref(), retry, &name, job).await;
                    (idx, attempts, result)
                });
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                () = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Cancellation requested, waiting for {} in-flight actions", tasks.len());
                    continue;
                }
            };

            let Some(joined) = joined else {
                break;
            };

            let (idx, attempts, result) = match joined {
                Ok(output) => output,
                Err(e) => {
                    error!("Apply task failed: {}", e);
                    if fatal.is_none() {
                        fatal = Some(ConvergeError::internal(format!("Apply task failed: {e}")));
                    }
                    continue;
                }
            };

            let action = &plan.actions[idx].action;
            match result {
                Ok(effect) => match self.record(action, effect).await {
                    Ok(outcome) => {
                        info!("{} {} done", action.action_type(), action.name());
                        outcomes[idx] = Some((outcome, attempts));
                        release(idx, &dependents, &mut waiting, &mut ready);
                    }
                    Err(e) => {
                        error!("Failed to record {}: {}", action.name(), e);
                        outcomes[idx] = Some((
                            ApplyOutcome::Failed {
                                error: e.to_string(),
                                consistent: false,
                            },
                            attempts,
                        ));
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                },
                Err(e) => {
                    let message = if attempts > 1 {
                        let exhausted = ApplyError::MaxRetriesExceeded {
                            attempts,
                            resource: action.name().to_string(),
                        };
                        format!("{exhausted}: {e}")
                    } else {
                        e.to_string()
                    };
                    error!("{} {} failed: {}", action.action_type(), action.name(), message);
                    outcomes[idx] = Some((
                        ApplyOutcome::Failed {
                            error: message,
                            consistent: e.leaves_consistent_state(),
                        },
                        attempts,
                    ));
                    skip_dependents(plan, idx, &dependents, &mut outcomes);
                }
            }
        }

        let results: Vec<ApplyResult> = plan
            .actions
            .iter()
            .zip(outcomes)
            .map(|(planned, outcome)| {
                let (outcome, attempts) = outcome.unwrap_or((ApplyOutcome::Cancelled, 0));
                ApplyResult {
                    name: planned.action.name().to_string(),
                    kind: planned.action.kind(),
                    action: planned.action.action_type(),
                    outcome,
                    attempts,
                }
            })
            .collect();
        let report = ApplyReport::from_results(results);

        if let Some(e) = fatal {
            return Err(e);
        }

        let error = (!report.is_success()).then(|| {
            format!(
                "{} failed, {} skipped, {} cancelled",
                report.failed, report.skipped, report.cancelled
            )
        });
        let touched = plan
            .changes()
            .iter()
            .map(|a| a.action.name().to_string())
            .collect();
        self.store
            .record_history(ApplyHistoryEntry::new(
                self.operation,
                &plan.fingerprint,
                touched,
                error,
            ))
            .await?;

        info!(
            "Apply finished: {} applied, {} deleted, {} unchanged, {} failed, {} skipped",
            report.applied, report.deleted, report.unchanged, report.failed, report.skipped
        );
        Ok(report)
    }

    /// Builds the provider call for an action, or `None` for a no-op.
    async fn prepare(&self, action: &ChangeAction) -> Result<Option<Job>> {
        match action {
            ChangeAction::NoOp { .. } => Ok(None),
            ChangeAction::Create { spec } => Ok(Some(Job::Create {
                kind: spec.kind,
                attributes: self.resolve(spec).await?,
            })),
            ChangeAction::Update { spec, observed, .. } => Ok(Some(Job::Update {
                provider_id: observed.provider_id.clone(),
                kind: spec.kind,
                attributes: self.resolve(spec).await?,
            })),
            ChangeAction::Delete { observed } => Ok(Some(Job::Delete {
                provider_id: observed.provider_id.clone(),
                kind: observed.kind,
            })),
        }
    }

    /// Attributes sent to the provider: the declared ones, the logical name,
    /// and `<attr>_id` for every reference.
    async fn resolve(&self, spec: &ResourceSpec) -> Result<Attributes> {
        let mut attributes = spec.attributes.clone();
        attributes.insert(
            String::from(NAME_ATTRIBUTE),
            serde_json::Value::String(spec.name.clone()),
        );

        for (attribute, target) in spec.references() {
            let Some(record) = self.store.get(target).await? else {
                return Err(ConvergeError::Apply(ApplyError::Aborted {
                    reason: format!(
                        "dependency '{target}' of '{}' has no recorded identifier",
                        spec.name
                    ),
                }));
            };
            attributes.insert(
                format!("{attribute}_id"),
                serde_json::Value::String(record.provider_id),
            );
        }
        Ok(attributes)
    }

    /// Writes the result of a successful call to the store.
    async fn record(&self, action: &ChangeAction, effect: Effect) -> Result<ApplyOutcome> {
        match (action, effect) {
            (
                ChangeAction::Create { spec } | ChangeAction::Update { spec, .. },
                Effect::Written {
                    provider_id,
                    computed,
                },
            ) => {
                let record = ObservedResource::new(
                    &spec.name,
                    spec.kind,
                    &provider_id,
                    spec.attributes.clone(),
                    spec.depends_on.clone(),
                )
                .with_computed(computed);
                self.store.put(record.clone()).await?;
                Ok(ApplyOutcome::Applied(record))
            }
            (ChangeAction::Delete { observed }, Effect::Deleted) => {
                self.store.delete(&observed.name).await?;
                Ok(ApplyOutcome::Deleted)
            }
            (action, _) => Err(ConvergeError::internal(format!(
                "Unexpected provider result for {} {}",
                action.action_type(),
                action.name()
            ))),
        }
    }
}

/// Marks an action complete and queues dependents whose last wait ended.
fn release(
    idx: usize,
    dependents: &[Vec<usize>],
    waiting: &mut [usize],
    ready: &mut BTreeSet<usize>,
) {
    for &d in &dependents[idx] {
        waiting[d] -= 1;
        if waiting[d] == 0 {
            ready.insert(d);
        }
    }
}

/// Marks every transitive dependent of a failed action as skipped.
fn skip_dependents(
    plan: &Plan,
    failed: usize,
    dependents: &[Vec<usize>],
    outcomes: &mut [Option<(ApplyOutcome, u32)>],
) {
    let blocked_by = plan.actions[failed].action.name().to_string();
    let mut stack: Vec<usize> = dependents[failed].clone();
    while let Some(d) = stack.pop() {
        if outcomes[d].is_some() {
            continue;
        }
        warn!(
            "Skipping {} because {} failed",
            plan.actions[d].action.name(),
            blocked_by
        );
        outcomes[d] = Some((
            ApplyOutcome::Skipped {
                blocked_by: blocked_by.clone(),
            },
            0,
        ));
        stack.extend(&dependents[d]);
    }
}

/// Runs one provider call with retries, then describes the resource for its
/// computed attributes.
async fn run_job(
    provider: &dyn CloudProvider,
    retry: RetryPolicy,
    name: &str,
    job: Job,
) -> (u32, ProviderResult<Effect>) {
    let retry_safe = provider.supports_safe_retry(job.kind(), job.operation());
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = call(provider, &job).await;
        let err = match result {
            Ok(effect) => return (attempt, Ok(with_computed(provider, &job, effect).await)),
            Err(err) => err,
        };

        if !err.is_retryable() || !retry_safe || attempt >= retry.max_attempts {
            return (attempt, Err(err));
        }

        let delay = retry.delay(attempt, &err);
        warn!(
            "{} {} attempt {}/{} failed: {}; retrying in {:?}",
            job.operation(),
            name,
            attempt,
            retry.max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

async fn call(provider: &dyn CloudProvider, job: &Job) -> ProviderResult<Effect> {
    match job {
        Job::Create { kind, attributes } => {
            let provider_id = provider.create_resource(*kind, attributes).await?;
            Ok(Effect::Written {
                provider_id,
                computed: Attributes::new(),
            })
        }
        Job::Update {
            provider_id,
            kind,
            attributes,
        } => {
            provider
                .update_resource(provider_id, *kind, attributes)
                .await?;
            Ok(Effect::Written {
                provider_id: provider_id.clone(),
                computed: Attributes::new(),
            })
        }
        Job::Delete { provider_id, kind } => {
            match provider.delete_resource(provider_id, *kind).await {
                Ok(()) => Ok(Effect::Deleted),
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{} already gone", provider_id);
                    Ok(Effect::Deleted)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Fills in provider-computed attributes; a failed describe leaves them empty.
async fn with_computed(provider: &dyn CloudProvider, job: &Job, effect: Effect) -> Effect {
    let Effect::Written { provider_id, .. } = effect else {
        return effect;
    };
    let kind = job.kind();
    let computed = match provider.describe_resource(&provider_id, kind).await {
        Ok(live) => live
            .into_iter()
            .filter(|(key, _)| kind.is_computed(key))
            .collect(),
        Err(e) => {
            debug!("Describe of {} failed: {}", provider_id, e);
            Attributes::new()
        }
    };
    Effect::Written {
        provider_id,
        computed,
    }
}
