//! Dependency ordering and cascade integration tests.
//!
//! These tests verify that dependents wait for their dependencies, that
//! failures cascade through the graph, and that cyclic edges are refused
//! without touching any state.

use serde_json::json;

use conductor::agent::AgentId;
use conductor::core::dag::CascadePolicy;
use conductor::core::task::TaskStatus;
use conductor::error::{Error, ErrorKind};
use conductor::orchestration::{AdmissionDecision, CoordinatorEvent};

use crate::fixtures::{analysis_task, search_task, test_config, Harness};

/// Test: Dependents are dispatched only after their dependency completes
/// Given a chain A <- B <- C
/// When tasks complete one at a time
/// Then each dependent is dispatched right after its dependency completes
#[test]
fn test_chain_dispatches_in_order() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let a = h.submit(search_task("s1")).task_id;
    let b = h.submit(analysis_task("s1").with_dependencies(vec![a])).task_id;
    let c = h.submit(analysis_task("s1").with_dependencies(vec![b])).task_id;

    assert_eq!(h.status(a), TaskStatus::Dispatched);
    assert_eq!(h.status(b), TaskStatus::Waiting);
    assert_eq!(h.status(c), TaskStatus::Waiting);
    assert_eq!(h.dispatches().len(), 1);

    let agent = h.assigned_agent(a).unwrap();
    h.complete(agent.as_str(), a, json!({"papers": 12}));
    assert_eq!(h.status(b), TaskStatus::Dispatched);
    assert_eq!(h.status(c), TaskStatus::Waiting);

    let agent = h.assigned_agent(b).unwrap();
    h.complete(agent.as_str(), b, json!({"summary": "ok"}));
    assert_eq!(h.status(c), TaskStatus::Dispatched);

    let order: Vec<_> = h.dispatches().into_iter().map(|(_, t)| t).collect();
    assert_eq!(order, vec![a, b, c]);

    let view = h.coordinator.status(&a).unwrap();
    assert_eq!(view.children, vec![b]);
}

/// Test: Scenario - failure cascades to transitive dependents
/// Given a chain A <- B <- C under mandatory cascade
/// When A exhausts its retries
/// Then B and C are cancelled and their reservations released
#[test]
fn test_failure_cascades_to_dependents() {
    let mut h = Harness::with_agents(test_config(), &["a1"]);
    let a = h.submit(search_task("s1")).task_id;
    let b = h.submit(analysis_task("s1").with_dependencies(vec![a])).task_id;
    let c = h.submit(analysis_task("s1").with_dependencies(vec![b])).task_id;
    assert!(h.coordinator.admission().reservation(&c).is_some());

    for _ in 0..3 {
        h.fail("a1", a, "source unavailable");
    }

    assert_eq!(h.status(a), TaskStatus::Failed);
    assert_eq!(h.status(b), TaskStatus::Cancelled);
    assert_eq!(h.status(c), TaskStatus::Cancelled);
    assert!(h.coordinator.admission().reservation(&b).is_none());
    assert!(h.coordinator.admission().reservation(&c).is_none());

    assert!(h.events.contains(&CoordinatorEvent::TaskCancelled { task_id: b }));
    assert!(h.events.contains(&CoordinatorEvent::TaskCancelled { task_id: c }));
    assert_eq!(h.dispatches().iter().filter(|(_, t)| *t == b).count(), 0);

    let ledger = h.coordinator.admission().ledger("s1").unwrap();
    assert!(ledger.reserved.abs() < 1e-9);
}

/// Test: Tolerant dependents run after a failed dependency
/// Given allow_tolerant cascade and a failure-tolerant dependent
/// When its dependency fails
/// Then the dependent is released instead of cancelled
#[test]
fn test_tolerant_dependent_released_on_failure() {
    let mut config = test_config();
    config.dependencies.cascade = CascadePolicy::AllowTolerant;
    let mut h = Harness::with_agents(config, &["a1"]);

    let a = h.submit(search_task("s1")).task_id;
    let tolerant = h
        .submit(
            analysis_task("s1")
                .with_dependencies(vec![a])
                .failure_tolerant(),
        )
        .task_id;
    let strict = h.submit(analysis_task("s1").with_dependencies(vec![a])).task_id;

    for _ in 0..3 {
        h.fail("a1", a, "source unavailable");
    }

    assert_eq!(h.status(tolerant), TaskStatus::Dispatched);
    assert_eq!(h.status(strict), TaskStatus::Cancelled);
}

/// Test: Cancelling a dependency cancels its dependents
/// Given A <- B <- C
/// When the caller cancels A
/// Then the cancel reports A, B and C
#[test]
fn test_cancel_cascades() {
    let mut h = Harness::with_agents(test_config(), &["a1"]);
    let a = h.submit(search_task("s1")).task_id;
    let b = h.submit(analysis_task("s1").with_dependencies(vec![a])).task_id;
    let c = h.submit(analysis_task("s1").with_dependencies(vec![b])).task_id;

    let mut cancelled = h.cancel(a);
    cancelled.sort();
    let mut expected = vec![a, b, c];
    expected.sort();
    assert_eq!(cancelled, expected);
    assert_eq!(h.cancelled_on("a1"), vec![a]);
    assert_eq!(
        h.coordinator
            .registry()
            .get(&AgentId::from("a1"))
            .unwrap()
            .current_load(),
        0
    );
}

/// Test: Cyclic edge is rejected without mutation
/// Given A and B where B depends on A, neither dispatched
/// When A is made to depend on B
/// Then CyclicDependency is returned and graph and tasks are unchanged
#[test]
fn test_cycle_rejected_without_mutation() {
    let mut config = test_config();
    config.admission.defer_when_no_agents = false;
    let mut h = Harness::new(config);

    let a = h.submit(search_task("s1")).task_id;
    let b = h.submit(search_task("s1").with_dependencies(vec![a])).task_id;
    assert_eq!(h.status(a), TaskStatus::Ready);
    assert_eq!(h.status(b), TaskStatus::Waiting);
    let edges_before = h.coordinator.dag().edge_count();

    let result = h.coordinator.add_dependency(a, b, h.now);
    assert!(matches!(result, Err(Error::CyclicDependency { .. })));

    assert_eq!(h.coordinator.dag().edge_count(), edges_before);
    assert_eq!(h.status(a), TaskStatus::Ready);
    assert_eq!(h.status(b), TaskStatus::Waiting);
    assert!(h.coordinator.status(&a).unwrap().dependencies.is_empty());
    assert!(h.coordinator.status(&b).unwrap().children.is_empty());
}

/// Test: Self dependency is rejected at submit
/// Given a task that lists itself as a dependency
/// When it is submitted
/// Then it is rejected and never enters the graph
#[test]
fn test_self_dependency_rejected() {
    let mut h = Harness::with_agents(test_config(), &["a1"]);
    let mut task = search_task("s1");
    task.dependencies = vec![task.id];
    let id = task.id;

    let receipt = h.submit(task);
    assert!(receipt.decision.is_rejected());
    assert_eq!(h.status(id), TaskStatus::Rejected);
    assert!(!h.coordinator.dag().contains_task(&id));
    assert!(h.dispatches().is_empty());
}

/// Test: Depending on a rejected task is a validation error
/// Given a task rejected by admission
/// When another task lists it as a dependency
/// Then the dependent is rejected as invalid
#[test]
fn test_dependency_on_rejected_task() {
    let mut config = test_config();
    config.admission.session_ceiling = 0.01;
    config.admission.warning_threshold = 0.01;
    let mut h = Harness::with_agents(config, &["a1"]);

    let rejected = h.submit(analysis_task("s1"));
    assert!(matches!(
        rejected.decision,
        AdmissionDecision::Rejected {
            kind: ErrorKind::CostRejected,
            ..
        }
    ));

    let dependent = h.submit(search_task("s2").with_dependencies(vec![rejected.task_id]));
    assert!(matches!(
        dependent.decision,
        AdmissionDecision::Rejected {
            kind: ErrorKind::ValidationError,
            ..
        }
    ));
}

/// Test: Cancelling a fan-out task cancels tasks waiting on its units
/// Given a task with parallelism 2 and a dependent waiting on its first unit
/// When the caller cancels the fan-out task
/// Then the dependent is cancelled, reported in the cancel list and its reservation released
#[test]
fn test_cancel_fan_out_cascades_to_unit_dependents() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;
    let units = h.coordinator.status(&logical).unwrap().sub_tasks;
    let b = h
        .submit(analysis_task("s1").with_dependencies(vec![units[0]]))
        .task_id;
    assert_eq!(h.status(b), TaskStatus::Waiting);

    let cancelled = h.cancel(logical);
    assert!(cancelled.contains(&b));
    assert_eq!(cancelled.len(), 4);
    assert_eq!(h.status(b), TaskStatus::Cancelled);
    assert!(h.coordinator.admission().reservation(&b).is_none());
    assert!(h.events.contains(&CoordinatorEvent::TaskCancelled { task_id: b }));
    assert_eq!(h.dispatches().iter().filter(|(_, t)| *t == b).count(), 0);
}

/// Test: A failed fan-out task cancels tasks waiting on its cancelled units
/// Given a task with parallelism 2 and a dependent waiting on its second unit
/// When the first unit exhausts its retries
/// Then the second unit and the dependent are both cancelled
#[test]
fn test_unit_failure_cascades_to_sibling_dependents() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;
    let units = h.coordinator.status(&logical).unwrap().sub_tasks;
    let b = h
        .submit(analysis_task("s1").with_dependencies(vec![units[1]]))
        .task_id;

    for _ in 0..3 {
        let agent = h.assigned_agent(units[0]).unwrap();
        h.fail(agent.as_str(), units[0], "upstream quota exceeded");
    }

    assert_eq!(h.status(logical), TaskStatus::Failed);
    assert_eq!(h.status(units[1]), TaskStatus::Cancelled);
    assert_eq!(h.status(b), TaskStatus::Cancelled);
    assert!(h.coordinator.admission().reservation(&b).is_none());
    let ledger = h.coordinator.admission().ledger("s1").unwrap();
    assert!(ledger.reserved.abs() < 1e-9);
}

/// Test: Depending on a failed task yields an approved but cancelled task
/// Given a task that has already failed under mandatory cascade
/// When a new task lists it as a dependency
/// Then the receipt is approved while the task is already cancelled and announced as such
#[test]
fn test_dependency_on_failed_task_cancels_on_submit() {
    let mut h = Harness::with_agents(test_config(), &["a1"]);
    let a = h.submit(search_task("s1")).task_id;
    for _ in 0..3 {
        h.fail("a1", a, "source unavailable");
    }
    assert_eq!(h.status(a), TaskStatus::Failed);

    let receipt = h.submit(analysis_task("s1").with_dependencies(vec![a]));
    assert!(receipt.decision.is_approved());
    assert_eq!(h.status(receipt.task_id), TaskStatus::Cancelled);
    assert!(h.events.contains(&CoordinatorEvent::TaskCancelled {
        task_id: receipt.task_id
    }));
    assert!(h
        .coordinator
        .admission()
        .reservation(&receipt.task_id)
        .is_none());
    assert!(h.submitted_to("a1").iter().all(|t| *t != receipt.task_id));
}
