//! Fan-out of logical tasks into parallel units.
//!
//! A logical task with `parallelism = N > 1` is expanded into N unit
//! envelopes, each with a fresh id and `parent_id` pointing back at the
//! logical task. The coordinator tracks group membership so results,
//! routing anti-affinity and cancellation can find a unit's siblings.

use std::collections::HashMap;

use crate::core::task::{TaskEnvelope, TaskId};
use crate::error::{Error, Result};

/// The units of one logical task, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutGroup {
    pub logical_id: TaskId,
    pub units: Vec<TaskId>,
}

impl FanOutGroup {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn index_of(&self, unit: &TaskId) -> Option<usize> {
        self.units.iter().position(|u| u == unit)
    }
}

#[derive(Debug, Default)]
pub struct FanOutCoordinator {
    groups: HashMap<TaskId, FanOutGroup>,
    /// unit id -> logical id
    owners: HashMap<TaskId, TaskId>,
}

impl FanOutCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand a logical task into its units.
    ///
    /// # Errors
    /// `Validation` if the task does not fan out or was already expanded.
    pub fn expand(&mut self, logical: &TaskEnvelope) -> Result<Vec<TaskEnvelope>> {
        if !logical.is_logical_fan_out() {
            return Err(Error::Validation(format!(
                "task {} has parallelism {} and does not fan out",
                logical.id, logical.parallelism
            )));
        }
        if self.groups.contains_key(&logical.id) {
            return Err(Error::Validation(format!(
                "task {} already expanded",
                logical.id
            )));
        }

        let units: Vec<TaskEnvelope> = (0..logical.parallelism as usize)
            .map(|index| logical.sub_task(index))
            .collect();
        let ids: Vec<TaskId> = units.iter().map(|u| u.id).collect();
        for id in &ids {
            self.owners.insert(*id, logical.id);
        }
        self.groups.insert(
            logical.id,
            FanOutGroup {
                logical_id: logical.id,
                units: ids,
            },
        );
        tracing::debug!(task_id = %logical.id, units = units.len(), "fan-out expanded");
        Ok(units)
    }

    pub fn group(&self, logical_id: &TaskId) -> Option<&FanOutGroup> {
        self.groups.get(logical_id)
    }

    /// Logical task owning a unit.
    pub fn owner_of(&self, unit: &TaskId) -> Option<TaskId> {
        self.owners.get(unit).copied()
    }

    /// Other units of the same logical task.
    pub fn siblings(&self, unit: &TaskId) -> Vec<TaskId> {
        self.owner_of(unit)
            .and_then(|owner| self.groups.get(&owner))
            .map(|g| g.units.iter().copied().filter(|u| u != unit).collect())
            .unwrap_or_default()
    }

    /// Forget a finished logical task and its units.
    pub fn remove(&mut self, logical_id: &TaskId) -> Option<FanOutGroup> {
        let group = self.groups.remove(logical_id)?;
        for unit in &group.units {
            self.owners.remove(unit);
        }
        Some(group)
    }

    pub fn is_unit(&self, id: &TaskId) -> bool {
        self.owners.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
