//! Agent registry.
//!
//! The `AgentRegistry` tracks connected agents, their declared capabilities
//! and concurrency limits, the tasks currently assigned to each, and their
//! liveness as derived from heartbeats.

use crate::agent::{AgentId, AgentRecord, AgentStatus, CapabilitySet};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Liveness thresholds, in heartbeat intervals.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    pub degraded_after: u32,
    pub missed_heartbeats: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        let config = crate::config::RegistryConfig::default();
        Self::from(&config)
    }
}

impl From<&crate::config::RegistryConfig> for LivenessConfig {
    fn from(config: &crate::config::RegistryConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            degraded_after: config.degraded_after,
            missed_heartbeats: config.missed_heartbeats,
        }
    }
}

impl LivenessConfig {
    /// Silence after which an agent is considered unreachable.
    pub fn eviction_window(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }

    fn degraded_window(&self) -> Duration {
        self.heartbeat_interval * self.degraded_after.max(1)
    }
}

/// Registry of live agents.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentRecord>,
    next_sequence: u64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent from its handshake.
    ///
    /// # Errors
    /// `DuplicateAgent` if the id is already registered, `Validation` for an
    /// empty capability set or zero concurrency.
    pub fn register(
        &mut self,
        id: AgentId,
        agent_type: &str,
        capabilities: CapabilitySet,
        max_concurrent: usize,
        now: Instant,
    ) -> Result<()> {
        if self.agents.contains_key(&id) {
            return Err(Error::DuplicateAgent { id });
        }
        if id.as_str().trim().is_empty() {
            return Err(Error::Validation("agent_id must not be empty".to_string()));
        }
        if capabilities.is_empty() {
            return Err(Error::Validation(format!(
                "agent {} advertises no capabilities",
                id
            )));
        }
        if max_concurrent == 0 {
            return Err(Error::Validation(format!(
                "agent {} declares max_concurrent = 0",
                id
            )));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::info!(
            agent_id = %id,
            agent_type,
            capabilities = %capabilities,
            max_concurrent,
            "agent registered"
        );
        self.agents.insert(
            id.clone(),
            AgentRecord::new(id, agent_type, capabilities, max_concurrent, sequence, now),
        );
        Ok(())
    }

    /// Record a heartbeat; the agent becomes healthy.
    ///
    /// # Errors
    /// `UnknownAgent` if the agent is not registered.
    pub fn heartbeat(&mut self, id: &AgentId, reported_load: usize, now: Instant) -> Result<()> {
        let record = self
            .agents
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAgent { id: id.clone() })?;
        if record.status != AgentStatus::Healthy {
            tracing::debug!(agent_id = %id, from = %record.status, "agent healthy");
        }
        record.last_heartbeat = now;
        record.reported_load = reported_load;
        record.status = AgentStatus::Healthy;
        Ok(())
    }

    /// Remove an agent, returning its record so in-flight tasks can be reassigned.
    pub fn deregister(&mut self, id: &AgentId) -> Option<AgentRecord> {
        let removed = self.agents.remove(id);
        if let Some(record) = &removed {
            tracing::info!(
                agent_id = %id,
                in_flight = record.current_load(),
                "agent deregistered"
            );
        }
        removed
    }

    /// Dispatchable agents advertising every required capability.
    ///
    /// Healthy agents come before degraded ones; within a group candidates
    /// are ordered by current load, then registration order.
    pub fn find_eligible(&self, required: &CapabilitySet) -> Vec<&AgentRecord> {
        let mut candidates: Vec<&AgentRecord> = self
            .agents
            .values()
            .filter(|a| a.is_dispatchable() && a.satisfies(required))
            .collect();
        candidates.sort_by_key(|a| {
            (
                a.status == AgentStatus::Degraded,
                a.current_load(),
                a.sequence,
            )
        });
        candidates
    }

    /// Whether any registered agent could ever serve these capabilities.
    pub fn any_capable(&self, required: &CapabilitySet) -> bool {
        self.agents
            .values()
            .any(|a| a.status != AgentStatus::Unreachable && a.satisfies(required))
    }

    /// Assign a task to an agent, incrementing its load.
    pub fn assign(&mut self, id: &AgentId, task_id: TaskId) -> Result<()> {
        let record = self
            .agents
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAgent { id: id.clone() })?;
        if !record.has_capacity() {
            return Err(Error::Validation(format!("agent {} is at capacity", id)));
        }
        record.in_flight.insert(task_id);
        Ok(())
    }

    /// Release a task from an agent. Returns false if it was not assigned there.
    pub fn release(&mut self, id: &AgentId, task_id: &TaskId) -> bool {
        self.agents
            .get_mut(id)
            .map(|record| record.in_flight.remove(task_id))
            .unwrap_or(false)
    }

    pub fn record_latency(&mut self, id: &AgentId, sample: Duration) {
        if let Some(record) = self.agents.get_mut(id) {
            record.record_latency(sample);
        }
    }

    /// Update liveness from heartbeat age and return agents that became unreachable.
    pub fn refresh_liveness(&mut self, now: Instant, liveness: &LivenessConfig) -> Vec<AgentId> {
        let mut unreachable = Vec::new();
        for record in self.agents.values_mut() {
            let silence = now.saturating_duration_since(record.last_heartbeat);
            if silence >= liveness.eviction_window() {
                if record.status != AgentStatus::Unreachable {
                    tracing::warn!(
                        agent_id = %record.id,
                        silence_ms = silence.as_millis() as u64,
                        "agent unreachable"
                    );
                }
                record.status = AgentStatus::Unreachable;
                unreachable.push(record.id.clone());
            } else if silence >= liveness.degraded_window()
                && record.status == AgentStatus::Healthy
            {
                tracing::warn!(agent_id = %record.id, "agent degraded");
                record.status = AgentStatus::Degraded;
            }
        }
        unreachable.sort_by_key(|id| self.agents.get(id).map(|a| a.sequence));
        unreachable
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Number of agents in each liveness state.
    pub fn status_counts(&self) -> HashMap<AgentStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.agents.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }
}
