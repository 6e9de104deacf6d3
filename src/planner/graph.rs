//! Dependency ordering.
//!
//! Kahn's algorithm over index-addressed nodes. Ready nodes sit in a
//! min-heap keyed by index, so the lowest index wins every tie and the
//! result is deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tracing::warn;

use crate::error::{ConvergeError, PlanError, Result};
use crate::model::ResourceModel;
use crate::state::ObservedResource;

/// Orders `n` nodes so that every node follows its predecessors.
///
/// `preds[i]` lists the nodes that must come before `i`. Returns the order
/// and the nodes that could not be emitted because they sit on or behind a
/// cycle.
fn kahn(preds: &[Vec<usize>]) -> (Vec<usize>, Vec<usize>) {
    let n = preds.len();
    let mut in_degree: Vec<usize> = preds.iter().map(Vec::len).collect();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, before) in preds.iter().enumerate() {
        for &p in before {
            succs[p].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &succs[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    let remaining = (0..n).filter(|i| in_degree[*i] > 0).collect();
    (order, remaining)
}

/// Walks predecessor edges among `remaining` until a node repeats, returning
/// the cycle in dependency direction.
fn find_cycle(preds: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let stuck: std::collections::HashSet<usize> = remaining.iter().copied().collect();
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    // Every stuck node has at least one stuck predecessor.
    while let Some(&next) = preds[current].iter().filter(|p| stuck.contains(*p)).min() {
        if let Some(&at) = seen.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path
}

/// Topological order of the model's enabled resources, as indices into
/// [`ResourceModel::resources`].
///
/// Dependencies on names outside the model are ignored here; the planner
/// checks them separately.
///
/// # Errors
///
/// Returns [`PlanError::Cycle`] naming the resources on a cycle.
pub fn topological_order(model: &ResourceModel) -> Result<Vec<usize>> {
    let preds: Vec<Vec<usize>> = model
        .resources()
        .iter()
        .map(|spec| {
            spec.depends_on
                .iter()
                .filter_map(|dep| model.position(dep))
                .collect()
        })
        .collect();

    let (order, remaining) = kahn(&preds);
    if remaining.is_empty() {
        return Ok(order);
    }

    let names: Vec<&str> = find_cycle(&preds, &remaining)
        .into_iter()
        .map(|i| model.resources()[i].name.as_str())
        .collect();
    Err(ConvergeError::Plan(PlanError::Cycle {
        cycle: names.join(" -> "),
    }))
}

/// Delete order for recorded resources: dependents before their
/// dependencies, ties broken by name.
///
/// Only edges between the given names are considered. A cycle in recorded
/// state cannot come from a valid apply; its members are appended by name.
#[must_use]
pub fn reverse_order(
    names: &[&str],
    observed: &BTreeMap<String, ObservedResource>,
) -> Vec<String> {
    let mut sorted: Vec<&str> = names.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let index: HashMap<&str, usize> = sorted.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    // A dependency must wait for all of its dependents.
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); sorted.len()];
    for (i, name) in sorted.iter().enumerate() {
        let Some(record) = observed.get(*name) else {
            continue;
        };
        for dep in &record.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                preds[d].push(i);
            }
        }
    }

    let (mut order, remaining) = kahn(&preds);
    if !remaining.is_empty() {
        warn!(
            "Recorded state contains a dependency cycle among {} resources",
            remaining.len()
        );
        order.extend(remaining);
    }

    order.into_iter().map(|i| sorted[i].to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Attributes, ConfigParser};
    use crate::model::ResourceKind;

    fn model(yaml: &str) -> ResourceModel {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        ResourceModel::load(&config).unwrap()
    }

    fn record(name: &str, deps: &[&str]) -> ObservedResource {
        ObservedResource::new(
            name,
            ResourceKind::KeyPair,
            &format!("key-{name}"),
            Attributes::new(),
            deps.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn test_kahn_prefers_declaration_order() {
        // 0 and 2 are both ready; 1 waits for 2.
        let (order, remaining) = kahn(&[vec![], vec![2], vec![]]);
        assert_eq!(order, vec![0, 2, 1]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_dependency_precedes_dependent() {
        let m = model(
            r"
project:
  name: ref
resources:
  - name: sub1
    kind: subnet
    attributes: { vpc: vpc1, cidr_block: 10.0.1.0/24 }
  - name: key1
    kind: key_pair
  - name: vpc1
    kind: network
    attributes: { cidr_block: 10.0.0.0/16 }
",
        );
        let order: Vec<&str> = topological_order(&m)
            .unwrap()
            .into_iter()
            .map(|i| m.resources()[i].name.as_str())
            .collect();
        assert_eq!(order, vec!["key1", "vpc1", "sub1"]);
    }

    #[test]
    fn test_cycle_is_named() {
        let m = model(
            r"
project:
  name: ref
resources:
  - name: key0
    kind: key_pair
  - name: a
    kind: key_pair
    depends_on: [b]
  - name: b
    kind: key_pair
    depends_on: [a]
",
        );
        let err = topological_order(&m).unwrap_err();
        match err {
            ConvergeError::Plan(PlanError::Cycle { cycle }) => assert_eq!(cycle, "a -> b -> a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reverse_order_deletes_dependents_first() {
        let observed: BTreeMap<String, ObservedResource> = [
            record("vpc1", &[]),
            record("sub1", &["vpc1"]),
            record("inst1", &["sub1"]),
            record("key1", &[]),
        ]
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

        let order = reverse_order(&["vpc1", "sub1", "inst1", "key1"], &observed);
        assert_eq!(order, vec!["inst1", "key1", "sub1", "vpc1"]);
    }
}
