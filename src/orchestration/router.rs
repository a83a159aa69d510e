//! Capability-based routing of ready tasks to agents.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use crate::agent::{AgentId, AgentRecord, AgentStatus, CapabilitySet};
use crate::error::{Error, Result};
use crate::orchestration::registry::AgentRegistry;

/// Load-balancing policy applied to eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Rotate through agents in registration order.
    RoundRobin,
    /// Prefer the highest fraction of free capacity.
    WeightedCapacity,
    #[default]
    LeastLoad,
    /// Prefer the lowest moving-average processing time.
    LatencyAware,
}

impl std::fmt::Display for LoadBalancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancePolicy::RoundRobin => write!(f, "round_robin"),
            LoadBalancePolicy::WeightedCapacity => write!(f, "weighted_capacity"),
            LoadBalancePolicy::LeastLoad => write!(f, "least_load"),
            LoadBalancePolicy::LatencyAware => write!(f, "latency_aware"),
        }
    }
}

/// Selects one agent per dispatch.
#[derive(Debug, Default)]
pub struct Router {
    policy: LoadBalancePolicy,
    /// Registration sequence of the last round-robin pick.
    cursor: Option<u64>,
}

impl Router {
    pub fn new(policy: LoadBalancePolicy) -> Self {
        Self {
            policy,
            cursor: None,
        }
    }

    pub fn policy(&self) -> LoadBalancePolicy {
        self.policy
    }

    /// Pick an agent for a task requiring `required`.
    ///
    /// Degraded agents are considered only when no healthy agent is
    /// eligible. Agents listed in `avoid` (those already serving sibling
    /// fan-out units) are skipped while any other candidate remains.
    ///
    /// # Errors
    /// `NoEligibleAgent` when no dispatchable agent advertises the capabilities.
    pub fn select(
        &mut self,
        registry: &AgentRegistry,
        required: &CapabilitySet,
        avoid: &HashSet<AgentId>,
    ) -> Result<AgentId> {
        let eligible = registry.find_eligible(required);
        let healthy: Vec<&AgentRecord> = eligible
            .iter()
            .copied()
            .filter(|a| a.status == AgentStatus::Healthy)
            .collect();
        let mut candidates = if healthy.is_empty() { eligible } else { healthy };

        if !avoid.is_empty() {
            let fresh: Vec<&AgentRecord> = candidates
                .iter()
                .copied()
                .filter(|a| !avoid.contains(&a.id))
                .collect();
            if !fresh.is_empty() {
                candidates = fresh;
            }
        }

        let chosen = match self.policy {
            LoadBalancePolicy::RoundRobin => self.next_in_rotation(&candidates),
            LoadBalancePolicy::LeastLoad => candidates.iter().copied().min_by(|a, b| tie_break(a, b)),
            LoadBalancePolicy::WeightedCapacity => candidates.iter().copied().min_by(|a, b| {
                b.free_ratio()
                    .total_cmp(&a.free_ratio())
                    .then_with(|| tie_break(a, b))
            }),
            LoadBalancePolicy::LatencyAware => candidates.iter().copied().min_by(|a, b| {
                latency(a)
                    .cmp(&latency(b))
                    .then_with(|| tie_break(a, b))
            }),
        };

        let agent = chosen.ok_or_else(|| Error::NoEligibleAgent {
            capabilities: required.to_string(),
        })?;
        tracing::debug!(
            agent_id = %agent.id,
            policy = %self.policy,
            candidates = candidates.len(),
            load = agent.current_load(),
            "agent selected"
        );
        Ok(agent.id.clone())
    }

    fn next_in_rotation<'a>(&mut self, candidates: &[&'a AgentRecord]) -> Option<&'a AgentRecord> {
        let mut ordered: Vec<&AgentRecord> = candidates.to_vec();
        ordered.sort_by_key(|a| a.sequence);
        let next = match self.cursor {
            Some(last) => ordered
                .iter()
                .copied()
                .find(|a| a.sequence > last)
                .or_else(|| ordered.first().copied()),
            None => ordered.first().copied(),
        };
        if let Some(agent) = next {
            self.cursor = Some(agent.sequence);
        }
        next
    }
}

/// Lowest current load, then earliest registration.
fn tie_break(a: &AgentRecord, b: &AgentRecord) -> Ordering {
    a.current_load()
        .cmp(&b.current_load())
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Agents without samples rank first.
fn latency(agent: &AgentRecord) -> Duration {
    agent.latency_ewma.unwrap_or(Duration::ZERO)
}
