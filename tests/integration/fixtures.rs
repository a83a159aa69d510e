//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A coordinator driven with a virtual clock
//! - Registering healthy agents
//! - Recording the messages sent to each agent
//! - Predefined task envelopes

use std::time::{Duration, Instant};

use serde_json::json;

use conductor::agent::{AgentId, CapabilitySet};
use conductor::config::Config;
use conductor::core::task::{Payload, PayloadKind, TaskEnvelope, TaskId, TaskStatus};
use conductor::orchestration::coordinator::Outbound;
use conductor::orchestration::{Coordinator, CoordinatorEvent, SubmitReceipt, TaskReport};
use conductor::protocol::CoordinatorMessage;

/// Config with immediate retries and payload size ignored in cost estimates.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.retry.jitter = 0.0;
    config.admission.cost_per_kib = 0.0;
    config
}

pub fn search_task(context: &str) -> TaskEnvelope {
    TaskEnvelope::new(
        context,
        "search",
        Payload::new(PayloadKind::Search, json!({"query": "protein folding"})),
    )
}

pub fn analysis_task(context: &str) -> TaskEnvelope {
    TaskEnvelope::new(
        context,
        "analysis",
        Payload::new(PayloadKind::Analysis, json!({"document": 42})),
    )
}

/// A coordinator plus a virtual clock and a log of outbound messages.
pub struct Harness {
    pub coordinator: Coordinator,
    pub now: Instant,
    pub sent: Vec<Outbound>,
    pub events: Vec<CoordinatorEvent>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self {
            coordinator: Coordinator::new(&config),
            now: Instant::now(),
            sent: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn with_agents(config: Config, ids: &[&str]) -> Self {
        let mut harness = Self::new(config);
        for id in ids {
            harness.agent(id, &["search", "analysis"], 4);
        }
        harness
    }

    /// Register an agent and send its first heartbeat.
    pub fn agent(&mut self, id: &str, capabilities: &[&str], max_concurrent: usize) {
        let caps: CapabilitySet = capabilities.iter().copied().collect();
        let agent = AgentId::from(id);
        self.coordinator
            .register(agent.clone(), "worker", caps, max_concurrent, self.now)
            .expect("register agent");
        self.coordinator
            .heartbeat(&agent, 0, self.now)
            .expect("first heartbeat");
        self.flush();
    }

    pub fn heartbeat(&mut self, id: &str) {
        let agent = AgentId::from(id);
        let load = self
            .coordinator
            .registry()
            .get(&agent)
            .map(|r| r.current_load())
            .unwrap_or(0);
        self.coordinator
            .heartbeat(&agent, load, self.now)
            .expect("heartbeat");
        self.flush();
    }

    /// Drop an agent as if its connection closed.
    pub fn deregister(&mut self, id: &str) {
        self.coordinator.deregister(&AgentId::from(id), self.now);
        self.flush();
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn sweep(&mut self) {
        self.coordinator.sweep_at(self.now);
        self.flush();
    }

    pub fn submit(&mut self, task: TaskEnvelope) -> SubmitReceipt {
        let receipt = self.coordinator.submit(task, self.now);
        self.flush();
        receipt
    }

    pub fn complete(&mut self, agent: &str, task: TaskId, result: serde_json::Value) {
        self.report(agent, task, TaskReport::completed(result));
    }

    pub fn fail(&mut self, agent: &str, task: TaskId, error: &str) {
        self.report(agent, task, TaskReport::failed(error));
    }

    pub fn report(&mut self, agent: &str, task: TaskId, report: TaskReport) {
        self.coordinator
            .handle_result(&AgentId::from(agent), &task, report, self.now);
        self.flush();
    }

    pub fn cancel(&mut self, task: TaskId) -> Vec<TaskId> {
        let cancelled = self.coordinator.cancel(task, self.now).expect("cancel");
        self.flush();
        cancelled
    }

    pub fn status(&self, task: TaskId) -> TaskStatus {
        self.coordinator.status(&task).expect("task exists").status
    }

    pub fn assigned_agent(&self, task: TaskId) -> Option<AgentId> {
        self.coordinator
            .status(&task)
            .expect("task exists")
            .assigned_agent
    }

    /// Task ids submitted to an agent, in send order.
    pub fn submitted_to(&self, agent: &str) -> Vec<TaskId> {
        self.sent
            .iter()
            .filter(|o| o.agent_id.as_str() == agent)
            .filter_map(|o| match &o.message {
                CoordinatorMessage::TaskSubmit { task_id, .. } => Some(*task_id),
                _ => None,
            })
            .collect()
    }

    /// Task ids cancelled on an agent, in send order.
    pub fn cancelled_on(&self, agent: &str) -> Vec<TaskId> {
        self.sent
            .iter()
            .filter(|o| o.agent_id.as_str() == agent)
            .filter_map(|o| match &o.message {
                CoordinatorMessage::TaskCancel { task_id } => Some(*task_id),
                _ => None,
            })
            .collect()
    }

    /// Every task_submit sent, as (agent, task) pairs.
    pub fn dispatches(&self) -> Vec<(AgentId, TaskId)> {
        self.sent
            .iter()
            .filter_map(|o| match &o.message {
                CoordinatorMessage::TaskSubmit { task_id, .. } => {
                    Some((o.agent_id.clone(), *task_id))
                }
                _ => None,
            })
            .collect()
    }

    fn flush(&mut self) {
        self.sent.extend(self.coordinator.drain_outbox());
        self.events.extend(self.coordinator.drain_events());
    }
}
