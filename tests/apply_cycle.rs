//! End-to-end apply cycles against the memory provider and local state.

use std::sync::Arc;

use infra_converge::config::ConfigParser;
use infra_converge::error::{ConvergeError, PlanError, ProviderError};
use infra_converge::planner::{ActionType, ApplyOutcome};
use infra_converge::provider::{Fault, MemoryProvider};
use infra_converge::state::LocalStateStore;
use infra_converge::{InfraConfig, Reconciler, ResourceModel};
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

fn parse(yaml: &str) -> InfraConfig {
    ConfigParser::new().parse_yaml(yaml, None).unwrap()
}

fn reconciler(yaml: &str, dir: &TempDir, provider: Arc<MemoryProvider>) -> Reconciler {
    let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
    Reconciler::new(parse(yaml), store, provider).unwrap()
}

#[tokio::test]
async fn vpc_and_subnet_end_to_end() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let r = reconciler(VPC1_SUB1, &dir, provider.clone());

    let plan = r.plan().await.unwrap();
    let actions: Vec<(ActionType, &str)> = plan
        .actions
        .iter()
        .map(|a| (a.action.action_type(), a.action.name()))
        .collect();
    assert_eq!(
        actions,
        vec![(ActionType::Create, "vpc1"), (ActionType::Create, "sub1")]
    );

    let report = r.apply(&plan).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);

    let state = r.snapshot().await.unwrap();
    assert_eq!(state.len(), 2);
    assert!(state["vpc1"].provider_id.starts_with("vpc-"));
    assert!(state["sub1"].provider_id.starts_with("subnet-"));
    assert_eq!(state["sub1"].depends_on, vec!["vpc1"]);

    let replan = r.plan().await.unwrap();
    assert!(replan.is_converged());
    assert_eq!(replan.noop_count(), 2);
}

#[tokio::test]
async fn permanent_subnet_failure_keeps_only_vpc() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new().with_fault(
        "sub1",
        Fault::Permanent(ProviderError::rejected(400, "cidr overlaps")),
    ));
    let r = reconciler(VPC1_SUB1, &dir, provider);

    let report = r.apply(&r.plan().await.unwrap()).await.unwrap();
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.result("sub1").unwrap().outcome,
        ApplyOutcome::Failed { .. }
    ));

    let state = r.snapshot().await.unwrap();
    let names: Vec<&str> = state.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["vpc1"]);

    // The next run only retries what is missing.
    let plan = r.plan().await.unwrap();
    assert_eq!(plan.create_count(), 1);
    assert_eq!(plan.noop_count(), 1);
}

#[tokio::test]
async fn removed_resources_are_deleted_dependents_first() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let full = r"
project:
  name: ref
resources:
  - name: vpc1
    kind: network
    attributes: { cidr_block: 10.0.0.0/16 }
  - name: sub1
    kind: subnet
    attributes: { vpc: vpc1, cidr_block: 10.0.1.0/24 }
  - name: key1
    kind: key_pair
  - name: inst1
    kind: compute_instance
    attributes: { subnet: sub1, key_pair: key1, image_id: ami-1, flavor: t3.micro }
";
    let first = reconciler(full, &dir, provider.clone());
    first.apply(&first.plan().await.unwrap()).await.unwrap();
    assert_eq!(provider.resource_count().await, 4);

    let second = reconciler(VPC1_SUB1, &dir, provider.clone());
    let plan = second.plan().await.unwrap();
    let deletes: Vec<&str> = plan
        .actions
        .iter()
        .filter(|a| a.action.action_type() == ActionType::Delete)
        .map(|a| a.action.name())
        .collect();
    assert_eq!(deletes, vec!["inst1", "key1"]);

    let report = second.apply(&plan).await.unwrap();
    assert!(report.is_success());
    assert_eq!(provider.resource_count().await, 2);
    assert!(second.plan().await.unwrap().is_converged());
}

#[tokio::test]
async fn dependency_cycle_is_rejected_before_anything_runs() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let r = reconciler(
        r"
project:
  name: ref
resources:
  - name: a
    kind: key_pair
    depends_on: [b]
  - name: b
    kind: key_pair
    depends_on: [a]
",
        &dir,
        provider.clone(),
    );

    let err = r.plan().await.unwrap_err();
    assert!(matches!(err, ConvergeError::Plan(PlanError::Cycle { .. })));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(provider.resource_count().await, 0);
}

#[tokio::test]
async fn unknown_dependency_fails_model_load() {
    let err = ResourceModel::load(&parse(
        r"
project:
  name: ref
resources:
  - name: sub1
    kind: subnet
    depends_on: [vpc9]
    attributes: { vpc: vpc1, cidr_block: 10.0.1.0/24 }
",
    ))
    .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn starter_template_applies_cleanly() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let r = reconciler(include_str!("../templates/converge.yaml"), &dir, provider);

    let report = r.apply(&r.plan().await.unwrap()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied, 6);
    assert!(r.store().history().await.unwrap().last().unwrap().success);
}
