//! Orchestration layer.
//!
//! Components that decide where and when tasks run: admission and cost
//! control, the agent registry, routing, fan-out and aggregation, health
//! monitoring and retries. The [`Coordinator`] ties them together as one
//! state machine and the [`CoordinatorActor`] drives it from channels.

pub mod actor;
pub mod admission;
pub mod aggregator;
pub mod coordinator;
pub mod fanout;
pub mod health;
pub mod registry;
pub mod retry;
pub mod router;

pub use actor::{AgentConnection, CoordinatorActor, CoordinatorHandle};
pub use admission::{AdmissionController, AdmissionDecision, CostTier, Estimate, SessionLedger};
pub use aggregator::{AggregateResult, PartialResult, ResultAggregator};
pub use coordinator::{
    Coordinator, CoordinatorEvent, QueueStats, SubmitReceipt, TaskOutcome, TaskReport, TaskView,
};
pub use fanout::FanOutCoordinator;
pub use health::{HealthEvent, HealthMonitor, RetryTracker};
pub use registry::AgentRegistry;
pub use retry::RetryPolicy;
pub use router::{LoadBalancePolicy, Router};
