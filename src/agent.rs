//! Agent record data model.
//!
//! Agents are external worker processes that connect to the coordinator,
//! advertise capabilities and execute dispatched tasks. The registry keeps
//! one `AgentRecord` per live connection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::core::task::TaskId;

/// Identifier chosen by the agent during the registration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A set of capability tags, ordered for stable display and comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: impl Into<String>) -> bool {
        self.0.insert(capability.into())
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// True when every capability in `self` is also in `other`.
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(", "))
    }
}

/// Liveness of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, no heartbeat received yet.
    #[default]
    Connecting,
    Healthy,
    /// Missed at least one heartbeat interval.
    Degraded,
    /// Missed too many heartbeats; about to be evicted.
    Unreachable,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Connecting => write!(f, "connecting"),
            AgentStatus::Healthy => write!(f, "healthy"),
            AgentStatus::Degraded => write!(f, "degraded"),
            AgentStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A live agent connection as seen by the registry.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: CapabilitySet,
    pub max_concurrent: usize,
    /// Tasks the coordinator currently has assigned to this agent.
    pub in_flight: BTreeSet<TaskId>,
    /// Load last reported by the agent in a heartbeat.
    pub reported_load: usize,
    pub status: AgentStatus,
    pub registered_at: Instant,
    pub last_heartbeat: Instant,
    /// Monotonic registration order, used for deterministic tie-breaks.
    pub sequence: u64,
    /// Moving average of reported processing time.
    pub latency_ewma: Option<Duration>,
}

/// Smoothing factor for the latency moving average.
const LATENCY_ALPHA: f64 = 0.3;

impl AgentRecord {
    pub fn new(
        id: AgentId,
        agent_type: &str,
        capabilities: CapabilitySet,
        max_concurrent: usize,
        sequence: u64,
        now: Instant,
    ) -> Self {
        Self {
            id,
            agent_type: agent_type.to_string(),
            capabilities,
            max_concurrent,
            in_flight: BTreeSet::new(),
            reported_load: 0,
            status: AgentStatus::Connecting,
            registered_at: now,
            last_heartbeat: now,
            sequence,
            latency_ewma: None,
        }
    }

    /// Count of in-flight tasks assigned by the coordinator.
    pub fn current_load(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load() < self.max_concurrent
    }

    /// Eligibility is a subset test on capabilities.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Fraction of capacity still free, 0.0 when saturated.
    pub fn free_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        let free = self.max_concurrent.saturating_sub(self.current_load());
        free as f64 / self.max_concurrent as f64
    }

    pub fn record_latency(&mut self, sample: Duration) {
        self.latency_ewma = Some(match self.latency_ewma {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - LATENCY_ALPHA) + sample.mul_f64(LATENCY_ALPHA),
        });
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(self.status, AgentStatus::Healthy | AgentStatus::Degraded) && self.has_capacity()
    }
}
