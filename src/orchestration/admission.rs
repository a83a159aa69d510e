//! Cost estimation and admission control.
//!
//! Every submitted task is estimated before it enters the scheduling
//! pipeline. The estimate is checked against the session's cost ledger and
//! the global total; the controller approves, defers or rejects it, and
//! reserves the estimate for approved work until the task settles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::AdmissionConfig;
use crate::core::task::{TaskEnvelope, TaskId};
use crate::error::ErrorKind;

/// Resource tier derived from the estimated cost, ordered by consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for CostTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CostTier::Low => write!(f, "low"),
            CostTier::Medium => write!(f, "medium"),
            CostTier::High => write!(f, "high"),
            CostTier::Critical => write!(f, "critical"),
        }
    }
}

/// Result of estimating a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub tier: CostTier,
    pub cost: f64,
    /// Parallelism after single-agent rules were applied.
    pub parallelism: u32,
}

/// Linear cost model over agent type weight, payload size and parallelism.
#[derive(Debug, Clone)]
pub struct CostModel {
    base_cost: f64,
    cost_per_kib: f64,
    tier_bounds: [f64; 3],
    weights: HashMap<String, f64>,
}

impl From<&AdmissionConfig> for CostModel {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            base_cost: config.base_cost,
            cost_per_kib: config.cost_per_kib,
            tier_bounds: config.tier_bounds,
            weights: config.agent_type_weights.clone(),
        }
    }
}

impl CostModel {
    /// Weight for an agent type; unknown types weigh 1.0.
    pub fn weight(&self, agent_type: &str) -> f64 {
        self.weights.get(agent_type).copied().unwrap_or(1.0)
    }

    /// Cost of running `task` as `parallelism` units.
    pub fn cost(&self, task: &TaskEnvelope, parallelism: u32) -> f64 {
        let units = f64::from(parallelism.max(1));
        let kib = task.payload.size_bytes() as f64 / 1024.0;
        self.base_cost * self.weight(&task.agent_type) * units + kib * self.cost_per_kib * units
    }

    pub fn tier(&self, cost: f64) -> CostTier {
        let [low, medium, high] = self.tier_bounds;
        if cost <= low {
            CostTier::Low
        } else if cost <= medium {
            CostTier::Medium
        } else if cost <= high {
            CostTier::High
        } else {
            CostTier::Critical
        }
    }
}

/// Accumulated cost for one context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLedger {
    pub context_id: String,
    /// Cost of settled work.
    pub spent: f64,
    /// Estimates held by approved, unsettled tasks.
    pub reserved: f64,
    pub admitted: u32,
    pub rejected: u32,
}

impl SessionLedger {
    pub fn new(context_id: &str) -> Self {
        Self {
            context_id: context_id.to_string(),
            ..Default::default()
        }
    }

    pub fn accumulated_cost(&self) -> f64 {
        self.spent + self.reserved
    }
}

/// Outcome of admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Approved { estimate: Estimate, advisory: bool },
    Deferred { estimate: Estimate, reason: String },
    Rejected { kind: ErrorKind, reason: String },
}

impl AdmissionDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, AdmissionDecision::Approved { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, AdmissionDecision::Rejected { .. })
    }

    pub fn rejected(kind: ErrorKind, reason: impl Into<String>) -> Self {
        AdmissionDecision::Rejected {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    context_id: String,
    amount: f64,
}

/// Owns the per-session ledgers and the global cost total.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    model: CostModel,
    ledgers: HashMap<String, SessionLedger>,
    reservations: HashMap<TaskId, Reservation>,
    global_spent: f64,
    global_reserved: f64,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let model = CostModel::from(&config);
        Self {
            config,
            model,
            ledgers: HashMap::new(),
            reservations: HashMap::new(),
            global_spent: 0.0,
            global_reserved: 0.0,
        }
    }

    /// Estimate cost and tier, applying the single-agent rules to parallelism.
    pub fn estimate(&self, task: &TaskEnvelope) -> Estimate {
        let requested = if self.config.single_agent_mode {
            1
        } else {
            task.parallelism.max(1)
        };
        let cost = self.model.cost(task, requested);
        let tier = self.model.tier(cost);

        let parallelism = if self.config.single_agent_for_low_tier && tier == CostTier::Low {
            1
        } else {
            requested
        };
        if parallelism == requested {
            return Estimate {
                tier,
                cost,
                parallelism,
            };
        }
        let cost = self.model.cost(task, parallelism);
        Estimate {
            tier: self.model.tier(cost),
            cost,
            parallelism,
        }
    }

    /// Decide admission for a task. Does not reserve.
    ///
    /// `any_capable` reports whether some registered agent advertises the
    /// task's capabilities.
    pub fn admit(&self, task: &TaskEnvelope, any_capable: bool) -> AdmissionDecision {
        if let Err(e) = task.validate() {
            return AdmissionDecision::rejected(e.kind(), e.to_string());
        }
        let estimate = self.estimate(task);
        self.decide(&task.context_id, estimate, any_capable)
    }

    /// Check a precomputed estimate against ceilings and agent availability.
    pub fn decide(&self, context_id: &str, estimate: Estimate, any_capable: bool) -> AdmissionDecision {
        let session_total = self
            .ledgers
            .get(context_id)
            .map(SessionLedger::accumulated_cost)
            .unwrap_or(0.0);
        let projected = session_total + estimate.cost;

        if projected > self.config.session_ceiling {
            return AdmissionDecision::rejected(
                ErrorKind::CostRejected,
                format!(
                    "session {} would reach {:.2}, ceiling is {:.2}",
                    context_id, projected, self.config.session_ceiling
                ),
            );
        }
        let global_projected = self.global_cost() + estimate.cost;
        if global_projected > self.config.global_ceiling {
            return AdmissionDecision::rejected(
                ErrorKind::CostRejected,
                format!(
                    "global cost would reach {:.2}, ceiling is {:.2}",
                    global_projected, self.config.global_ceiling
                ),
            );
        }
        if !any_capable && self.config.defer_when_no_agents {
            return AdmissionDecision::Deferred {
                estimate,
                reason: "no registered agent advertises the required capabilities".to_string(),
            };
        }
        AdmissionDecision::Approved {
            estimate,
            advisory: projected > self.config.warning_threshold,
        }
    }

    /// Hold `amount` against the task's session and the global total.
    pub fn reserve(&mut self, task_id: TaskId, context_id: &str, amount: f64) {
        let ledger = self
            .ledgers
            .entry(context_id.to_string())
            .or_insert_with(|| SessionLedger::new(context_id));
        ledger.reserved += amount;
        ledger.admitted += 1;
        self.global_reserved += amount;
        self.reservations.insert(
            task_id,
            Reservation {
                context_id: context_id.to_string(),
                amount,
            },
        );
    }

    /// Count a rejection against the session.
    pub fn record_rejection(&mut self, context_id: &str) {
        self.ledgers
            .entry(context_id.to_string())
            .or_insert_with(|| SessionLedger::new(context_id))
            .rejected += 1;
    }

    /// Replace a task's reservation with what it actually cost.
    ///
    /// Returns false when the task holds no reservation.
    pub fn settle(&mut self, task_id: &TaskId, charged: f64) -> bool {
        let Some(reservation) = self.reservations.remove(task_id) else {
            return false;
        };
        let charged = charged.max(0.0);
        if let Some(ledger) = self.ledgers.get_mut(&reservation.context_id) {
            ledger.reserved = (ledger.reserved - reservation.amount).max(0.0);
            ledger.spent += charged;
        }
        self.global_reserved = (self.global_reserved - reservation.amount).max(0.0);
        self.global_spent += charged;
        tracing::debug!(
            task_id = %task_id,
            reserved = reservation.amount,
            charged,
            "cost settled"
        );
        true
    }

    pub fn reservation(&self, task_id: &TaskId) -> Option<f64> {
        self.reservations.get(task_id).map(|r| r.amount)
    }

    pub fn ledger(&self, context_id: &str) -> Option<&SessionLedger> {
        self.ledgers.get(context_id)
    }

    pub fn ledgers(&self) -> impl Iterator<Item = &SessionLedger> {
        self.ledgers.values()
    }

    /// Spent plus reserved across all sessions.
    pub fn global_cost(&self) -> f64 {
        self.global_spent + self.global_reserved
    }
}
