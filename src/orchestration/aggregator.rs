//! Collects unit outcomes per logical task.
//!
//! Results are ordered by unit index, never by completion order. The first
//! unit that exhausts its retries closes the group with whatever partial
//! results have arrived.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::core::task::{TaskError, TaskId};

/// Terminal outcome of one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed(serde_json::Value),
    Failed(TaskError),
}

/// A completed unit's result inside a failed aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub unit_index: usize,
    pub result: serde_json::Value,
}

/// Combined result of a logical task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AggregateResult {
    /// Every unit completed; results in unit order.
    Completed { results: Vec<serde_json::Value> },
    /// A unit exhausted its retries.
    Failed {
        partial_results: Vec<PartialResult>,
        failed_units: Vec<usize>,
        error: TaskError,
    },
}

impl AggregateResult {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug)]
struct Collector {
    expected: usize,
    completed: BTreeMap<usize, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    open: HashMap<TaskId, Collector>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting `expected` unit outcomes for a logical task.
    pub fn open(&mut self, logical_id: TaskId, expected: usize) {
        self.open.insert(
            logical_id,
            Collector {
                expected,
                completed: BTreeMap::new(),
            },
        );
    }

    pub fn is_open(&self, logical_id: &TaskId) -> bool {
        self.open.contains_key(logical_id)
    }

    /// Record a unit outcome. Returns the aggregate once the group resolves.
    ///
    /// Outcomes for closed or unknown groups and repeated outcomes for a
    /// unit are ignored.
    pub fn record(
        &mut self,
        logical_id: &TaskId,
        unit_index: usize,
        outcome: UnitOutcome,
    ) -> Option<AggregateResult> {
        let collector = self.open.get_mut(logical_id)?;
        if unit_index >= collector.expected || collector.completed.contains_key(&unit_index) {
            return None;
        }

        match outcome {
            UnitOutcome::Completed(value) => {
                collector.completed.insert(unit_index, value);
                if collector.completed.len() < collector.expected {
                    return None;
                }
                let collector = self.open.remove(logical_id)?;
                Some(AggregateResult::Completed {
                    results: collector.completed.into_values().collect(),
                })
            }
            UnitOutcome::Failed(error) => {
                let collector = self.open.remove(logical_id)?;
                Some(AggregateResult::Failed {
                    partial_results: into_partials(collector.completed),
                    failed_units: vec![unit_index],
                    error,
                })
            }
        }
    }

    /// Close a group without a result, returning what had completed.
    pub fn close(&mut self, logical_id: &TaskId) -> Vec<PartialResult> {
        self.open
            .remove(logical_id)
            .map(|c| into_partials(c.completed))
            .unwrap_or_default()
    }

    /// Results collected so far, in unit order.
    pub fn partial(&self, logical_id: &TaskId) -> Vec<PartialResult> {
        self.open
            .get(logical_id)
            .map(|c| {
                c.completed
                    .iter()
                    .map(|(i, v)| PartialResult {
                        unit_index: *i,
                        result: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn into_partials(completed: BTreeMap<usize, serde_json::Value>) -> Vec<PartialResult> {
    completed
        .into_iter()
        .map(|(unit_index, result)| PartialResult { unit_index, result })
        .collect()
}
