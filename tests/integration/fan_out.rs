//! Fan-out and aggregation integration tests.
//!
//! These tests verify that logical tasks with parallelism > 1 are split
//! into independently dispatched units and that unit outcomes are folded
//! back into a single result.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;

use conductor::agent::AgentId;
use conductor::core::task::{TaskId, TaskStatus};
use conductor::error::ErrorKind;
use conductor::orchestration::TaskReport;

use crate::fixtures::{search_task, test_config, Harness};

fn unit_with_index(h: &Harness, logical: TaskId, index: usize) -> TaskId {
    let view = h.coordinator.status(&logical).unwrap();
    view.sub_tasks
        .into_iter()
        .find(|u| h.coordinator.task(u).and_then(|t| t.unit_index) == Some(index))
        .expect("unit exists")
}

/// Test: Fan-out produces N distinct units on distinct agents
/// Given three healthy agents
/// When a task with parallelism 3 is submitted
/// Then three units with fresh ids are dispatched to three different agents
#[test]
fn test_fan_out_dispatches_distinct_units() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2", "a3"]);
    let receipt = h.submit(search_task("s1").with_parallelism(3));
    assert!(receipt.decision.is_approved());

    let logical = receipt.task_id;
    let view = h.coordinator.status(&logical).unwrap();
    assert_eq!(view.status, TaskStatus::Running);
    assert_eq!(view.sub_tasks.len(), 3);

    let units: HashSet<TaskId> = view.sub_tasks.iter().copied().collect();
    assert_eq!(units.len(), 3);
    assert!(!units.contains(&logical));

    let dispatches = h.dispatches();
    assert_eq!(dispatches.len(), 3);
    let agents: HashSet<AgentId> = dispatches.iter().map(|(a, _)| a.clone()).collect();
    assert_eq!(agents.len(), 3, "sibling units should land on distinct agents");

    let mut indices: Vec<usize> = view
        .sub_tasks
        .iter()
        .map(|u| {
            let unit = h.coordinator.task(u).unwrap();
            assert_eq!(unit.parent_id, Some(logical));
            assert_eq!(unit.parallelism, 1);
            unit.unit_index.unwrap()
        })
        .collect();
    indices.sort();
    assert_eq!(indices, vec![0, 1, 2]);

    // The logical task itself is never sent to an agent.
    assert!(dispatches.iter().all(|(_, t)| *t != logical));
}

/// Test: Results are combined in unit order
/// Given a fan-out task whose units finish in reverse order
/// When the last unit completes
/// Then the logical task completes with results ordered by unit index
#[test]
fn test_fan_out_results_in_unit_order() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2", "a3"]);
    let logical = h.submit(search_task("s1").with_parallelism(3)).task_id;

    for index in [2usize, 1, 0] {
        assert_ne!(h.status(logical), TaskStatus::Completed);
        let unit = unit_with_index(&h, logical, index);
        let agent = h.assigned_agent(unit).unwrap();
        h.complete(agent.as_str(), unit, json!({ "unit": index }));
    }

    let outcome = h.coordinator.result(&logical).unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(
        outcome.result,
        Some(json!([{"unit": 0}, {"unit": 1}, {"unit": 2}]))
    );
}

/// Test: Scenario - one unit exhausts its retries through timeouts
/// Given parallelism 3 on three agents with max_attempts 3
/// When two units complete and the third times out on every attempt
/// Then the logical task fails with SubtaskFailure and two partial results
#[test]
fn test_unit_timeouts_fail_logical_with_partials() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2", "a3"]);
    let logical = h
        .submit(
            search_task("s1")
                .with_parallelism(3)
                .with_timeout(Duration::from_secs(5)),
        )
        .task_id;

    for index in [0usize, 1] {
        let unit = unit_with_index(&h, logical, index);
        let agent = h.assigned_agent(unit).unwrap();
        h.complete(agent.as_str(), unit, json!(format!("partial-{}", index)));
    }

    let stuck = unit_with_index(&h, logical, 2);
    let first_holder = h.assigned_agent(stuck).unwrap();

    for _ in 0..3 {
        assert!(!h.status(logical).is_terminal());
        h.advance(Duration::from_secs(6));
        for agent in ["a1", "a2", "a3"] {
            h.heartbeat(agent);
        }
        h.sweep();
    }

    assert!(h.cancelled_on(first_holder.as_str()).contains(&stuck));
    let dispatched_stuck = h.dispatches().iter().filter(|(_, t)| *t == stuck).count();
    assert_eq!(dispatched_stuck, 3);
    assert_eq!(h.status(stuck), TaskStatus::Failed);

    let outcome = h.coordinator.result(&logical).unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::SubtaskFailure);

    let result = outcome.result.unwrap();
    assert_eq!(result["outcome"], "failed");
    assert_eq!(result["failed_units"], json!([2]));
    let partials = result["partial_results"].as_array().unwrap();
    assert_eq!(partials.len(), 2);
    assert_eq!(partials[0]["unit_index"], 0);
    assert_eq!(partials[0]["result"], "partial-0");
    assert_eq!(partials[1]["unit_index"], 1);

    // Every agent's load was released.
    for agent in ["a1", "a2", "a3"] {
        let record = h.coordinator.registry().get(&AgentId::from(agent)).unwrap();
        assert_eq!(record.current_load(), 0);
    }
}

/// Test: A failing unit cancels its unfinished siblings
/// Given parallelism 3 where one unit keeps failing on the agent
/// When that unit exhausts its retries
/// Then the other in-flight units are cancelled on their agents
#[test]
fn test_unit_failure_cancels_siblings() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2", "a3"]);
    let logical = h.submit(search_task("s1").with_parallelism(3)).task_id;
    let failing = unit_with_index(&h, logical, 0);
    let sibling = unit_with_index(&h, logical, 1);
    let sibling_agent = h.assigned_agent(sibling).unwrap();

    for _ in 0..3 {
        let agent = h.assigned_agent(failing).unwrap();
        h.fail(agent.as_str(), failing, "upstream quota exceeded");
    }

    assert_eq!(h.status(logical), TaskStatus::Failed);
    assert_eq!(h.status(sibling), TaskStatus::Cancelled);
    assert!(h.cancelled_on(sibling_agent.as_str()).contains(&sibling));
}

/// Test: Cancelling a logical task cancels every unit
/// Given a running fan-out task
/// When the caller cancels it
/// Then all units are cancelled and late results are ignored
#[test]
fn test_cancel_logical_cancels_units() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2", "a3"]);
    let logical = h.submit(search_task("s1").with_parallelism(3)).task_id;
    let units = h.coordinator.status(&logical).unwrap().sub_tasks;
    let holders: Vec<AgentId> = units
        .iter()
        .map(|u| h.assigned_agent(*u).unwrap())
        .collect();

    let cancelled = h.cancel(logical);
    assert_eq!(cancelled.len(), 4);
    assert_eq!(h.status(logical), TaskStatus::Cancelled);
    for (unit, agent) in units.iter().zip(&holders) {
        assert_eq!(h.status(*unit), TaskStatus::Cancelled);
        assert!(h.cancelled_on(agent.as_str()).contains(unit));
    }

    h.complete(holders[0].as_str(), units[0], json!("late"));
    assert_eq!(h.status(units[0]), TaskStatus::Cancelled);
    assert!(h.cancel(logical).is_empty());
}

/// Test: Cancelling a unit cancels the logical task
/// Given a running fan-out task
/// When the caller cancels one unit
/// Then the logical task and every sibling are cancelled
#[test]
fn test_cancel_unit_cancels_logical() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;
    let unit = unit_with_index(&h, logical, 1);

    let cancelled = h.cancel(unit);
    assert!(cancelled.contains(&logical));
    assert_eq!(cancelled.len(), 3);
    assert_eq!(h.status(logical), TaskStatus::Cancelled);
}

/// Test: Anti-affinity falls back when agents run out
/// Given two agents and parallelism 3
/// When the task is submitted
/// Then all three units are dispatched across both agents
#[test]
fn test_anti_affinity_falls_back_to_policy() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    h.submit(search_task("s1").with_parallelism(3));

    let dispatches = h.dispatches();
    assert_eq!(dispatches.len(), 3);
    let agents: HashSet<AgentId> = dispatches.iter().map(|(a, _)| a.clone()).collect();
    assert_eq!(agents.len(), 2);
}

/// Test: Reported unit costs roll up to the logical task
/// Given a fan-out task whose units report costs
/// When every unit completes
/// Then the logical task's actual cost is the sum and the ledger is settled
#[test]
fn test_unit_costs_roll_up() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;

    for index in [0usize, 1] {
        let unit = unit_with_index(&h, logical, index);
        let agent = h.assigned_agent(unit).unwrap();
        h.report(
            agent.as_str(),
            unit,
            TaskReport::completed(json!(index)).with_cost(0.25),
        );
    }

    let view = h.coordinator.status(&logical).unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert!((view.cost_actual.unwrap() - 0.5).abs() < 1e-9);

    let ledger = h.coordinator.admission().ledger("s1").unwrap();
    assert!((ledger.spent - 0.5).abs() < 1e-9);
    assert!(ledger.reserved.abs() < 1e-9);
}

/// Test: Cancelling a fan-out task charges the cost its units already reported
/// Given a task with parallelism 2 whose first unit completed at 0.25
/// When the caller cancels the task
/// Then the session is charged 0.25 and nothing stays reserved
#[test]
fn test_cancel_charges_completed_unit_cost() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;
    let first = unit_with_index(&h, logical, 0);
    let agent = h.assigned_agent(first).unwrap();
    h.report(
        agent.as_str(),
        first,
        TaskReport::completed(json!(0)).with_cost(0.25),
    );

    h.cancel(logical);

    let view = h.coordinator.status(&logical).unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert!((view.cost_actual.unwrap() - 0.25).abs() < 1e-9);
    let ledger = h.coordinator.admission().ledger("s1").unwrap();
    assert!((ledger.spent - 0.25).abs() < 1e-9);
    assert!(ledger.reserved.abs() < 1e-9);
    assert!((h.coordinator.admission().global_cost() - 0.25).abs() < 1e-9);
}

/// Test: Units that report no cost are charged their share of the estimate
/// Given a task with parallelism 2
/// When one unit completes at 0.25 and the other completes without a cost
/// Then the logical task is charged 0.25 plus the silent unit's estimate
#[test]
fn test_unreported_unit_cost_uses_estimate() {
    let mut h = Harness::with_agents(test_config(), &["a1", "a2"]);
    let logical = h.submit(search_task("s1").with_parallelism(2)).task_id;
    let first = unit_with_index(&h, logical, 0);
    let second = unit_with_index(&h, logical, 1);
    let share = h.coordinator.task(&second).unwrap().cost_estimate.unwrap();
    assert!(share > 0.0);

    let agent = h.assigned_agent(first).unwrap();
    h.report(
        agent.as_str(),
        first,
        TaskReport::completed(json!(0)).with_cost(0.25),
    );
    let agent = h.assigned_agent(second).unwrap();
    h.complete(agent.as_str(), second, json!(1));

    let view = h.coordinator.status(&logical).unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert!((view.cost_actual.unwrap() - (0.25 + share)).abs() < 1e-9);
    let ledger = h.coordinator.admission().ledger("s1").unwrap();
    assert!((ledger.spent - (0.25 + share)).abs() < 1e-9);
    assert!(ledger.reserved.abs() < 1e-9);
}
