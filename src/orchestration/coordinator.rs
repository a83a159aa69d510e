//! Single-writer coordinator state machine.
//!
//! The `Coordinator` owns every piece of shared orchestration state: the
//! task table, the agent registry, the dependency graph, the cost ledgers
//! and the fan-out groups. It is driven by discrete operations (submit,
//! register, heartbeat, result, cancel, sweep), each of which runs to
//! completion before the next one starts. The actor in
//! [`crate::orchestration::actor`] serializes those operations; tests call
//! them directly with an explicit `now`.
//!
//! Operations never perform I/O. Messages for agents accumulate in an
//! outbox and lifecycle notifications in an event buffer; the caller drains
//! both after each operation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::agent::{AgentId, CapabilitySet};
use crate::config::{Config, TimeoutConfig};
use crate::core::dag::{Cascade, DependencyTracker, Readiness};
use crate::core::task::{TaskEnvelope, TaskError, TaskId, TaskStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::orchestration::admission::{AdmissionController, AdmissionDecision, SessionLedger};
use crate::orchestration::aggregator::{AggregateResult, ResultAggregator, UnitOutcome};
use crate::orchestration::fanout::FanOutCoordinator;
use crate::orchestration::health::{Deadline, HealthEvent, HealthMonitor, RetryVerdict};
use crate::orchestration::registry::{AgentRegistry, LivenessConfig};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::router::Router;
use crate::protocol::{CoordinatorMessage, TaskResultStatus};
use crate::state::{AgentSnapshot, Snapshot};

/// Lifecycle notifications for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    TaskAdmitted { task_id: TaskId, advisory: bool },
    TaskDeferred { task_id: TaskId, reason: String },
    TaskRejected {
        task_id: TaskId,
        kind: ErrorKind,
        reason: String,
    },
    TaskReady { task_id: TaskId },
    TaskDispatched { task_id: TaskId, agent_id: AgentId },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        kind: ErrorKind,
    },
    TaskCompleted { task_id: TaskId },
    TaskFailed { task_id: TaskId, kind: ErrorKind },
    TaskCancelled { task_id: TaskId },
    AgentRegistered { agent_id: AgentId },
    AgentDeregistered { agent_id: AgentId },
    AgentEvicted {
        agent_id: AgentId,
        reassigned: Vec<TaskId>,
    },
}

impl CoordinatorEvent {
    /// The task the event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CoordinatorEvent::TaskAdmitted { task_id, .. }
            | CoordinatorEvent::TaskDeferred { task_id, .. }
            | CoordinatorEvent::TaskRejected { task_id, .. }
            | CoordinatorEvent::TaskReady { task_id }
            | CoordinatorEvent::TaskDispatched { task_id, .. }
            | CoordinatorEvent::TaskRetrying { task_id, .. }
            | CoordinatorEvent::TaskCompleted { task_id }
            | CoordinatorEvent::TaskFailed { task_id, .. }
            | CoordinatorEvent::TaskCancelled { task_id } => Some(*task_id),
            _ => None,
        }
    }

    /// Whether the event reports a terminal task state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorEvent::TaskRejected { .. }
                | CoordinatorEvent::TaskCompleted { .. }
                | CoordinatorEvent::TaskFailed { .. }
                | CoordinatorEvent::TaskCancelled { .. }
        )
    }
}

/// A message queued for one agent connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub agent_id: AgentId,
    pub message: CoordinatorMessage,
}

/// Returned from `submit`.
///
/// The decision covers admission only. An approved task that depends on an
/// already failed or cancelled task is cancelled within the same call, so
/// callers should read its status rather than assume it will run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub decision: AdmissionDecision,
}

/// Caller-facing view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub context_id: String,
    pub status: TaskStatus,
    pub parallelism: u32,
    pub attempts: u32,
    pub assigned_agent: Option<AgentId>,
    pub cost_estimate: Option<f64>,
    pub cost_actual: Option<f64>,
    pub advisory: bool,
    pub dependencies: Vec<TaskId>,
    pub children: Vec<TaskId>,
    pub sub_tasks: Vec<TaskId>,
    pub last_error: Option<TaskError>,
    pub created_at: chrono::DateTime<Utc>,
    pub admitted_at: Option<chrono::DateTime<Utc>>,
    pub dispatched_at: Option<chrono::DateTime<Utc>>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<&TaskEnvelope> for TaskView {
    fn from(task: &TaskEnvelope) -> Self {
        Self {
            task_id: task.id,
            parent_id: task.parent_id,
            context_id: task.context_id.clone(),
            status: task.status,
            parallelism: task.parallelism,
            attempts: task.attempts,
            assigned_agent: task.assigned_agent.clone(),
            cost_estimate: task.cost_estimate,
            cost_actual: task.cost_actual,
            advisory: task.advisory,
            dependencies: task.dependencies.clone(),
            children: task.children.clone(),
            sub_tasks: task.sub_tasks.clone(),
            last_error: task.last_error.clone(),
            created_at: task.created_at,
            admitted_at: task.admitted_at,
            dispatched_at: task.dispatched_at,
            completed_at: task.completed_at,
        }
    }
}

/// Terminal outcome of a task.
///
/// For a failed fan-out task `result` carries the partial results and the
/// indices of the failed units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub cost: Option<f64>,
}

/// Aggregate queue and cost statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub tasks_by_status: BTreeMap<String, usize>,
    pub agents_by_status: BTreeMap<String, usize>,
    pub ready_queue: usize,
    pub deferred: usize,
    pub global_cost: f64,
    pub sessions: Vec<SessionLedger>,
}

/// What an agent reported at the end of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub status: TaskResultStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processing_time: Duration,
    pub cost: Option<f64>,
}

impl TaskReport {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: TaskResultStatus::Completed,
            result: Some(result),
            error: None,
            processing_time: Duration::ZERO,
            cost: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskResultStatus::Failed,
            result: None,
            error: Some(error.into()),
            processing_time: Duration::ZERO,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Instant-based clocks for a task.
#[derive(Debug, Clone, Default)]
struct TaskClock {
    ready_since: Option<Instant>,
    dispatched_at: Option<Instant>,
    not_before: Option<Instant>,
}

pub struct Coordinator {
    tasks: HashMap<TaskId, TaskEnvelope>,
    clocks: HashMap<TaskId, TaskClock>,
    ready_queue: VecDeque<TaskId>,
    deferred: VecDeque<TaskId>,
    registry: AgentRegistry,
    dag: DependencyTracker,
    admission: AdmissionController,
    router: Router,
    fanout: FanOutCoordinator,
    aggregator: ResultAggregator,
    health: HealthMonitor,
    timeouts: TimeoutConfig,
    outbox: Vec<Outbound>,
    events: Vec<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        Self {
            tasks: HashMap::new(),
            clocks: HashMap::new(),
            ready_queue: VecDeque::new(),
            deferred: VecDeque::new(),
            registry: AgentRegistry::new(),
            dag: DependencyTracker::new(config.dependencies.cascade),
            admission: AdmissionController::new(config.admission.clone()),
            router: Router::new(config.dispatch.policy),
            fanout: FanOutCoordinator::new(),
            aggregator: ResultAggregator::new(),
            health: HealthMonitor::new(
                LivenessConfig::from(&config.registry),
                RetryPolicy::from(&config.retry),
            ),
            timeouts: config.timeouts.clone(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn dag(&self) -> &DependencyTracker {
        &self.dag
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskEnvelope> {
        self.tasks.get(id)
    }

    /// Take the messages queued for agents.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the buffered lifecycle events.
    pub fn drain_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.events)
    }

    // ---------------------------------------------------------------------
    // Caller operations
    // ---------------------------------------------------------------------

    /// Submit a logical task.
    ///
    /// Validation, dependency lookup and admission all run before the task
    /// touches the graph or the ledgers.
    pub fn submit(&mut self, mut task: TaskEnvelope, now: Instant) -> SubmitReceipt {
        let task_id = task.id;
        if self.tasks.contains_key(&task_id) {
            return SubmitReceipt {
                task_id,
                decision: AdmissionDecision::rejected(
                    ErrorKind::ValidationError,
                    format!("task id {} already exists", task_id),
                ),
            };
        }
        task.status = TaskStatus::Created;
        task.parent_id = None;
        task.unit_index = None;

        if let Err(e) = self.check_dependencies_known(&task) {
            return self.reject(task, e.kind(), e.to_string());
        }

        let any_capable = self.registry.any_capable(&task.required_capabilities);
        let decision = self.admission.admit(&task, any_capable);
        match decision {
            AdmissionDecision::Rejected { kind, reason } => self.reject(task, kind, reason),
            AdmissionDecision::Deferred { estimate, reason } => {
                task.cost_estimate = Some(estimate.cost);
                tracing::info!(task_id = %task_id, reason = %reason, "task deferred");
                self.events.push(CoordinatorEvent::TaskDeferred {
                    task_id,
                    reason: reason.clone(),
                });
                self.tasks.insert(task_id, task);
                self.deferred.push_back(task_id);
                SubmitReceipt {
                    task_id,
                    decision: AdmissionDecision::Deferred { estimate, reason },
                }
            }
            AdmissionDecision::Approved { estimate, advisory } => {
                match self.activate(task, estimate.cost, estimate.parallelism, advisory, now) {
                    Ok(()) => SubmitReceipt {
                        task_id,
                        decision: AdmissionDecision::Approved { estimate, advisory },
                    },
                    Err((task, e)) => self.reject(task, e.kind(), e.to_string()),
                }
            }
        }
    }

    /// Add a dependency edge between two admitted tasks.
    ///
    /// `task` must not have been dispatched yet. A cycle is rejected and
    /// leaves the graph untouched.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId, now: Instant) -> Result<()> {
        let status = self
            .tasks
            .get(&task)
            .map(|t| (t.status, t.sub_tasks.is_empty() && t.unit_index.is_none()))
            .ok_or(Error::TaskNotFound { id: task })?;
        if !self.tasks.contains_key(&depends_on) {
            return Err(Error::TaskNotFound { id: depends_on });
        }
        match status {
            (TaskStatus::Admitted | TaskStatus::Waiting | TaskStatus::Ready, true) => {}
            (s, _) => {
                return Err(Error::Validation(format!(
                    "task {} is {} and can no longer gain dependencies",
                    task, s
                )))
            }
        }

        let readiness = self.dag.add_dependency(&depends_on, &task)?;
        if let Some(t) = self.tasks.get_mut(&task) {
            t.dependencies.push(depends_on);
        }
        if let Some(dep) = self.tasks.get_mut(&depends_on) {
            dep.children.push(task);
        }
        match readiness {
            Readiness::Ready => {}
            Readiness::Waiting { .. } => {
                if let Some(t) = self.tasks.get_mut(&task) {
                    if t.status == TaskStatus::Ready {
                        t.transition(TaskStatus::Waiting)?;
                    }
                }
            }
            Readiness::Blocked => {
                self.cancel_tree(task, now);
            }
        }
        Ok(())
    }

    /// Cancel a task and everything that depends on it.
    ///
    /// Cancelling a fan-out unit cancels its logical task. Cancelling a
    /// terminal task is a no-op. Returns every task cancelled as a result.
    pub fn cancel(&mut self, task_id: TaskId, now: Instant) -> Result<Vec<TaskId>> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(Error::TaskNotFound { id: task_id })?;
        let target = task.parent_id.unwrap_or(task_id);
        let cancelled = self.cancel_tree(target, now);
        if !cancelled.is_empty() {
            tracing::info!(task_id = %task_id, cancelled = cancelled.len(), "task cancelled");
            self.dispatch_ready(now);
        }
        Ok(cancelled)
    }

    pub fn status(&self, task_id: &TaskId) -> Result<TaskView> {
        self.tasks
            .get(task_id)
            .map(TaskView::from)
            .ok_or(Error::TaskNotFound { id: *task_id })
    }

    /// The outcome of a task, once terminal.
    pub fn result(&self, task_id: &TaskId) -> Result<Option<TaskOutcome>> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or(Error::TaskNotFound { id: *task_id })?;
        if !task.is_terminal() {
            return Ok(None);
        }
        Ok(Some(TaskOutcome {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.last_error.clone(),
            cost: task.cost_actual,
        }))
    }

    pub fn stats(&self) -> QueueStats {
        let mut tasks_by_status = BTreeMap::new();
        for task in self.tasks.values() {
            *tasks_by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        let agents_by_status = self
            .registry
            .status_counts()
            .into_iter()
            .map(|(status, n)| (status.to_string(), n))
            .collect();
        let mut sessions: Vec<SessionLedger> = self.admission.ledgers().cloned().collect();
        sessions.sort_by(|a, b| a.context_id.cmp(&b.context_id));

        QueueStats {
            tasks_by_status,
            agents_by_status,
            ready_queue: self.count_with_status(TaskStatus::Ready),
            deferred: self.deferred.len(),
            global_cost: self.admission.global_cost(),
            sessions,
        }
    }

    /// Capture the task table and ledgers.
    pub fn snapshot(&self) -> Snapshot {
        let mut tasks: Vec<TaskEnvelope> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        let mut ledgers: Vec<SessionLedger> = self.admission.ledgers().cloned().collect();
        ledgers.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        let mut agents: Vec<AgentSnapshot> = self.registry.agents().map(AgentSnapshot::from).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Snapshot {
            tasks,
            ledgers,
            agents,
            global_cost: self.admission.global_cost(),
            taken_at: Utc::now(),
        }
    }

    // ---------------------------------------------------------------------
    // Agent operations
    // ---------------------------------------------------------------------

    /// Register an agent and retry deferred and waiting work.
    pub fn register(
        &mut self,
        agent_id: AgentId,
        agent_type: &str,
        capabilities: CapabilitySet,
        max_concurrent: usize,
        now: Instant,
    ) -> Result<()> {
        self.registry
            .register(agent_id.clone(), agent_type, capabilities, max_concurrent, now)?;
        self.events
            .push(CoordinatorEvent::AgentRegistered { agent_id });
        self.retry_deferred(now);
        self.dispatch_ready(now);
        Ok(())
    }

    pub fn heartbeat(&mut self, agent_id: &AgentId, load: usize, now: Instant) -> Result<()> {
        self.registry.heartbeat(agent_id, load, now)?;
        self.dispatch_ready(now);
        Ok(())
    }

    /// Remove an agent whose connection closed. Its in-flight tasks are
    /// returned to `ready`.
    pub fn deregister(&mut self, agent_id: &AgentId, now: Instant) {
        let Some(record) = self.registry.deregister(agent_id) else {
            return;
        };
        let reassigned = self.reclaim(agent_id, record.in_flight.into_iter().collect(), now);
        tracing::info!(agent_id = %agent_id, reassigned = reassigned.len(), "agent disconnected");
        self.events.push(CoordinatorEvent::AgentDeregistered {
            agent_id: agent_id.clone(),
        });
        self.dispatch_ready(now);
    }

    /// The agent began executing a task.
    pub fn task_started(&mut self, agent_id: &AgentId, task_id: &TaskId) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if task.assigned_agent.as_ref() == Some(agent_id) && task.status == TaskStatus::Dispatched
            {
                let _ = task.transition(TaskStatus::Running);
                tracing::debug!(task_id = %task_id, agent_id = %agent_id, "task running");
            }
        }
    }

    /// Apply a `task_result` reported by an agent.
    ///
    /// Results from agents that no longer hold the task (after eviction,
    /// timeout or cancellation) are ignored.
    pub fn handle_result(
        &mut self,
        agent_id: &AgentId,
        task_id: &TaskId,
        report: TaskReport,
        now: Instant,
    ) {
        let TaskReport {
            status,
            result,
            error,
            processing_time,
            cost,
        } = report;
        let Some(task) = self.tasks.get_mut(task_id) else {
            tracing::warn!(task_id = %task_id, agent_id = %agent_id, "result for unknown task");
            return;
        };
        if task.assigned_agent.as_ref() != Some(agent_id) || !task.status.is_in_flight() {
            tracing::debug!(
                task_id = %task_id,
                agent_id = %agent_id,
                status = %task.status,
                "ignoring stale result"
            );
            return;
        }

        if let Some(cost) = cost {
            task.cost_actual = Some(task.cost_actual.unwrap_or(0.0) + cost.max(0.0));
        }
        self.registry.release(agent_id, task_id);
        self.registry.record_latency(agent_id, processing_time);
        if let Some(clock) = self.clocks.get_mut(task_id) {
            clock.dispatched_at = None;
        }

        match status {
            TaskResultStatus::Completed => {
                tracing::info!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    processing_ms = processing_time.as_millis() as u64,
                    "task completed"
                );
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.result = result;
                    if task.transition(TaskStatus::Completed).is_ok() {
                        self.finish_success(*task_id, now);
                    }
                }
            }
            TaskResultStatus::Failed => {
                let message = error.unwrap_or_else(|| "agent reported failure".to_string());
                tracing::warn!(task_id = %task_id, agent_id = %agent_id, error = %message, "task failed on agent");
                self.fail_attempt(*task_id, TaskError::new(ErrorKind::AgentError, message), now);
            }
        }
        self.dispatch_ready(now);
    }

    // ---------------------------------------------------------------------
    // Periodic sweep
    // ---------------------------------------------------------------------

    /// Evict silent agents, time out stalled tasks, then dispatch.
    pub fn sweep_at(&mut self, now: Instant) {
        let deadlines = self.deadlines();
        let events = self.health.sweep(&mut self.registry, &deadlines, now);

        for event in events {
            match event {
                HealthEvent::AgentEvicted {
                    agent_id,
                    in_flight,
                } => {
                    let reassigned = self.reclaim(&agent_id, in_flight, now);
                    self.events.push(CoordinatorEvent::AgentEvicted {
                        agent_id,
                        reassigned,
                    });
                }
                HealthEvent::TaskTimedOut {
                    task_id,
                    agent_id,
                    elapsed,
                } => {
                    let still_held = self
                        .tasks
                        .get(&task_id)
                        .map(|t| t.status.is_in_flight() && t.assigned_agent == agent_id)
                        .unwrap_or(false);
                    if !still_held {
                        continue;
                    }
                    if let Some(agent_id) = &agent_id {
                        self.registry.release(agent_id, &task_id);
                        self.outbox.push(Outbound {
                            agent_id: agent_id.clone(),
                            message: CoordinatorMessage::TaskCancel { task_id },
                        });
                    }
                    let error = Error::TaskTimeout {
                        id: task_id,
                        elapsed,
                    };
                    self.fail_attempt(task_id, TaskError::from(&error), now);
                }
                HealthEvent::ReadyExpired { task_id, .. } => {
                    let (still_ready, capabilities) = match self.tasks.get(&task_id) {
                        Some(t) => (t.status == TaskStatus::Ready, t.required_capabilities.to_string()),
                        None => (false, String::new()),
                    };
                    if still_ready {
                        let error = Error::NoEligibleAgent { capabilities };
                        self.fail_attempt(task_id, TaskError::from(&error), now);
                    }
                }
            }
        }

        self.dispatch_ready(now);
    }

    fn deadlines(&self) -> Vec<Deadline> {
        let mut deadlines = Vec::new();
        for (id, clock) in &self.clocks {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            let timeout = self.timeout_for(task);
            match (task.status, &task.assigned_agent) {
                (s, Some(agent)) if s.is_in_flight() => {
                    if let Some(since) = clock.dispatched_at {
                        deadlines.push(Deadline {
                            task_id: *id,
                            agent_id: Some(agent.clone()),
                            since,
                            timeout,
                        });
                    }
                }
                (TaskStatus::Ready, None) => {
                    if let Some(since) = clock.ready_since {
                        deadlines.push(Deadline {
                            task_id: *id,
                            agent_id: None,
                            since,
                            timeout,
                        });
                    }
                }
                _ => {}
            }
        }
        deadlines.sort_by_key(|d| d.since);
        deadlines
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Assign ready tasks to agents in FIFO order. Returns the number dispatched.
    ///
    /// A task with no eligible agent stays in the queue; later tasks with
    /// other capabilities may still be dispatched.
    pub fn dispatch_ready(&mut self, now: Instant) -> usize {
        let mut dispatched = 0;
        let mut remaining = VecDeque::with_capacity(self.ready_queue.len());

        while let Some(task_id) = self.ready_queue.pop_front() {
            let (capabilities, parent) = match self.tasks.get(&task_id) {
                Some(t) if t.status == TaskStatus::Ready => {
                    (t.required_capabilities.clone(), t.parent_id)
                }
                _ => continue,
            };
            let backing_off = self
                .clocks
                .get(&task_id)
                .and_then(|c| c.not_before)
                .map(|at| now < at)
                .unwrap_or(false);
            if backing_off {
                remaining.push_back(task_id);
                continue;
            }

            let avoid = self.sibling_agents(&task_id, parent);
            match self.router.select(&self.registry, &capabilities, &avoid) {
                Ok(agent_id) => {
                    if self.assign(task_id, agent_id, now).is_ok() {
                        dispatched += 1;
                    } else {
                        remaining.push_back(task_id);
                    }
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "no agent available");
                    remaining.push_back(task_id);
                }
            }
        }

        self.ready_queue = remaining;
        dispatched
    }

    fn assign(&mut self, task_id: TaskId, agent_id: AgentId, now: Instant) -> Result<()> {
        self.registry.assign(&agent_id, task_id)?;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(Error::TaskNotFound { id: task_id })?;
        if let Err(e) = task.transition(TaskStatus::Dispatched) {
            self.registry.release(&agent_id, &task_id);
            return Err(e);
        }
        task.assigned_agent = Some(agent_id.clone());
        task.attempts += 1;
        let message = CoordinatorMessage::submit(task);

        let clock = self.clocks.entry(task_id).or_default();
        clock.dispatched_at = Some(now);
        clock.not_before = None;

        tracing::info!(task_id = %task_id, agent_id = %agent_id, "task dispatched");
        self.outbox.push(Outbound {
            agent_id: agent_id.clone(),
            message,
        });
        self.events
            .push(CoordinatorEvent::TaskDispatched { task_id, agent_id });
        Ok(())
    }

    /// Agents currently serving sibling fan-out units.
    fn sibling_agents(&self, task_id: &TaskId, parent: Option<TaskId>) -> HashSet<AgentId> {
        if parent.is_none() {
            return HashSet::new();
        }
        self.fanout
            .siblings(task_id)
            .iter()
            .filter_map(|s| self.tasks.get(s))
            .filter(|s| s.status.is_in_flight())
            .filter_map(|s| s.assigned_agent.clone())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Internal transitions
    // ---------------------------------------------------------------------

    fn check_dependencies_known(&self, task: &TaskEnvelope) -> Result<()> {
        task.validate()?;
        for dep in &task.dependencies {
            if !self.dag.contains_task(dep) {
                return Err(Error::Validation(format!(
                    "dependency {} is not an admitted task",
                    dep
                )));
            }
        }
        Ok(())
    }

    fn reject(&mut self, mut task: TaskEnvelope, kind: ErrorKind, reason: String) -> SubmitReceipt {
        let task_id = task.id;
        tracing::warn!(task_id = %task_id, kind = %kind, reason = %reason, "task rejected");
        task.status = TaskStatus::Rejected;
        task.completed_at = Some(Utc::now());
        task.last_error = Some(TaskError::new(kind, reason.clone()));
        self.admission.record_rejection(&task.context_id);
        self.events.push(CoordinatorEvent::TaskRejected {
            task_id,
            kind,
            reason: reason.clone(),
        });
        self.tasks.entry(task_id).or_insert(task);
        SubmitReceipt {
            task_id,
            decision: AdmissionDecision::Rejected { kind, reason },
        }
    }

    /// Enter an approved task into the graph and reserve its cost.
    ///
    /// On a graph error nothing has been mutated and the task is handed back.
    fn activate(
        &mut self,
        mut task: TaskEnvelope,
        estimate: f64,
        parallelism: u32,
        advisory: bool,
        now: Instant,
    ) -> std::result::Result<(), (TaskEnvelope, Error)> {
        let task_id = task.id;
        let readiness = match self.dag.admit(
            task_id,
            &task.dependencies,
            None,
            task.failure_tolerant,
        ) {
            Ok(r) => r,
            Err(e) => return Err((task, e)),
        };

        task.parallelism = parallelism;
        task.cost_estimate = Some(estimate);
        task.advisory = advisory;
        task.status = TaskStatus::Admitted;
        task.admitted_at = Some(Utc::now());
        self.admission.reserve(task_id, &task.context_id, estimate);
        for dep in &task.dependencies {
            if let Some(parent) = self.tasks.get_mut(dep) {
                parent.children.push(task_id);
            }
        }
        tracing::info!(
            task_id = %task_id,
            context_id = %task.context_id,
            estimate,
            parallelism,
            advisory,
            "task admitted"
        );
        self.tasks.insert(task_id, task);
        self.events
            .push(CoordinatorEvent::TaskAdmitted { task_id, advisory });

        match readiness {
            Readiness::Ready => self.make_ready(task_id, now),
            Readiness::Waiting { unmet } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    let _ = task.transition(TaskStatus::Waiting);
                }
                tracing::debug!(task_id = %task_id, unmet, "task waiting on dependencies");
            }
            Readiness::Blocked => {
                self.cancel_tree(task_id, now);
            }
        }
        self.dispatch_ready(now);
        Ok(())
    }

    /// Release a task for dispatch, expanding fan-out tasks into units.
    fn make_ready(&mut self, task_id: TaskId, now: Instant) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.transition(TaskStatus::Ready).is_err() {
            return;
        }

        if !task.is_logical_fan_out() {
            self.clocks.insert(
                task_id,
                TaskClock {
                    ready_since: Some(now),
                    ..TaskClock::default()
                },
            );
            self.ready_queue.push_back(task_id);
            self.events.push(CoordinatorEvent::TaskReady { task_id });
            return;
        }

        let logical = task.clone();
        let units = match self.fanout.expand(&logical) {
            Ok(units) => units,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "fan-out failed");
                return;
            }
        };
        let unit_estimate = logical.cost_estimate.map(|c| c / units.len() as f64);
        let unit_ids: Vec<TaskId> = units.iter().map(|u| u.id).collect();
        self.aggregator.open(task_id, units.len());

        for mut unit in units {
            let unit_id = unit.id;
            if let Err(e) = self
                .dag
                .admit(unit_id, &[], Some(task_id), unit.failure_tolerant)
            {
                tracing::error!(task_id = %unit_id, error = %e, "failed to track unit");
                continue;
            }
            unit.cost_estimate = unit_estimate;
            unit.status = TaskStatus::Ready;
            unit.admitted_at = Some(Utc::now());
            self.tasks.insert(unit_id, unit);
            self.clocks.insert(
                unit_id,
                TaskClock {
                    ready_since: Some(now),
                    ..TaskClock::default()
                },
            );
            self.ready_queue.push_back(unit_id);
            self.events.push(CoordinatorEvent::TaskReady { task_id: unit_id });
        }

        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.sub_tasks = unit_ids;
            let _ = task.transition(TaskStatus::Running);
        }
    }

    /// Consume one attempt of a task; re-queue it or fail it.
    fn fail_attempt(&mut self, task_id: TaskId, error: TaskError, now: Instant) {
        match self.tasks.get(&task_id) {
            Some(task) if !task.is_terminal() => {}
            _ => return,
        }
        let verdict = self.health.record_failure(&task_id);
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let kind = error.kind;
        task.last_error = Some(error.clone());

        match verdict {
            RetryVerdict::Retry { attempt, backoff } if kind.is_transient() => {
                if task.status != TaskStatus::Ready {
                    let _ = task.transition(TaskStatus::Ready);
                }
                let clock = self.clocks.entry(task_id).or_default();
                clock.ready_since = Some(now);
                clock.dispatched_at = None;
                clock.not_before = Some(now + backoff);
                if !self.ready_queue.contains(&task_id) {
                    self.ready_queue.push_back(task_id);
                }
                tracing::warn!(
                    task_id = %task_id,
                    attempt,
                    kind = %kind,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying task"
                );
                self.events.push(CoordinatorEvent::TaskRetrying {
                    task_id,
                    attempt,
                    kind,
                });
            }
            _ => {
                if task.fail(error).is_ok() {
                    tracing::warn!(task_id = %task_id, kind = %kind, "task failed");
                    self.finish_failure(task_id, now);
                }
            }
        }
    }

    /// Return an agent's in-flight tasks to `ready`.
    ///
    /// Only tasks the agent still holds are reclaimed, so each one moves
    /// back exactly once.
    fn reclaim(&mut self, agent_id: &AgentId, in_flight: Vec<TaskId>, now: Instant) -> Vec<TaskId> {
        let mut reclaimed = Vec::new();
        for task_id in in_flight {
            let held = self
                .tasks
                .get(&task_id)
                .map(|t| t.status.is_in_flight() && t.assigned_agent.as_ref() == Some(agent_id))
                .unwrap_or(false);
            if !held {
                continue;
            }
            let error = Error::AgentUnreachable {
                id: agent_id.clone(),
            };
            self.fail_attempt(task_id, TaskError::from(&error), now);
            reclaimed.push(task_id);
        }
        reclaimed
    }

    fn finish_success(&mut self, task_id: TaskId, now: Instant) {
        self.health.forget(&task_id);
        self.clocks.remove(&task_id);
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let parent = task.parent_id;
        let unit_index = task.unit_index;
        let result = task.result.clone().unwrap_or(serde_json::Value::Null);

        if parent.is_none() {
            let charged = task.cost_actual.or(task.cost_estimate).unwrap_or(0.0);
            self.admission.settle(&task_id, charged);
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.cost_actual = Some(charged);
            }
        }
        self.events.push(CoordinatorEvent::TaskCompleted { task_id });

        if let Ok(released) = self.dag.complete(&task_id) {
            for child in released {
                self.make_ready(child, now);
            }
        }

        if let (Some(logical), Some(index)) = (parent, unit_index) {
            if let Some(aggregate) =
                self.aggregator
                    .record(&logical, index, UnitOutcome::Completed(result))
            {
                self.resolve_logical(logical, aggregate, now);
            }
        }
    }

    fn finish_failure(&mut self, task_id: TaskId, now: Instant) {
        self.health.forget(&task_id);
        self.clocks.remove(&task_id);
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let parent = task.parent_id;
        let unit_index = task.unit_index;
        let error = task
            .last_error
            .clone()
            .unwrap_or_else(|| TaskError::new(ErrorKind::Internal, "unknown failure"));

        if parent.is_none() {
            let charged = task.cost_actual.unwrap_or(0.0);
            self.admission.settle(&task_id, charged);
        }
        self.events.push(CoordinatorEvent::TaskFailed {
            task_id,
            kind: error.kind,
        });

        if let Ok(cascade) = self.dag.fail(&task_id) {
            self.propagate(cascade, now);
        }

        if let (Some(logical), Some(index)) = (parent, unit_index) {
            if let Some(aggregate) = self
                .aggregator
                .record(&logical, index, UnitOutcome::Failed(error))
            {
                self.resolve_logical(logical, aggregate, now);
            }
        }
    }

    /// Apply the aggregate outcome to a fan-out logical task.
    fn resolve_logical(&mut self, logical_id: TaskId, aggregate: AggregateResult, now: Instant) {
        let unit_ids = self
            .fanout
            .remove(&logical_id)
            .map(|g| g.units)
            .unwrap_or_default();

        match aggregate {
            AggregateResult::Completed { results } => {
                let charged = self.fan_out_charge(&logical_id);
                let Some(task) = self.tasks.get_mut(&logical_id) else {
                    return;
                };
                task.result = Some(serde_json::Value::Array(results));
                task.cost_actual = charged;
                if task.transition(TaskStatus::Completed).is_ok() {
                    tracing::info!(task_id = %logical_id, units = unit_ids.len(), "fan-out completed");
                    self.finish_success(logical_id, now);
                }
            }
            AggregateResult::Failed {
                partial_results,
                failed_units,
                error,
            } => {
                let subtask_error = Error::SubtaskFailure {
                    id: logical_id,
                    failed: failed_units.clone(),
                };
                let message = format!("{} ({}: {})", subtask_error, error.kind, error.message);
                let partial = AggregateResult::Failed {
                    partial_results,
                    failed_units: failed_units.clone(),
                    error,
                };

                for unit in &unit_ids {
                    self.cancel_single(*unit, now);
                }

                let charged = self.fan_out_charge(&logical_id);
                let Some(task) = self.tasks.get_mut(&logical_id) else {
                    return;
                };
                task.result = Some(partial.to_value());
                task.cost_actual = charged;
                if task
                    .fail(TaskError::new(ErrorKind::SubtaskFailure, message))
                    .is_ok()
                {
                    tracing::warn!(task_id = %logical_id, failed_units = ?failed_units, "fan-out failed");
                    self.finish_failure(logical_id, now);
                }
            }
        }
    }

    /// Cancel a task, its un-terminal units and its transitive dependents.
    fn cancel_tree(&mut self, task_id: TaskId, now: Instant) -> Vec<TaskId> {
        let Some(task) = self.tasks.get(&task_id) else {
            return Vec::new();
        };
        if task.is_terminal() {
            return Vec::new();
        }
        let units = task.sub_tasks.clone();
        let mut cancelled = Vec::new();

        for unit in units {
            cancelled.extend(self.cancel_single(unit, now));
        }
        self.aggregator.close(&task_id);
        self.fanout.remove(&task_id);

        cancelled.extend(self.cancel_single(task_id, now));
        if let Ok(cascade) = self.dag.cancel(&task_id) {
            cancelled.extend(self.propagate(cascade, now));
        }
        cancelled
    }

    /// Cancel the dependents a cascade reached and ready the ones it released.
    fn propagate(&mut self, cascade: Cascade, now: Instant) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for dependent in cascade.cancelled {
            cancelled.extend(self.cancel_single(dependent, now));
        }
        for child in cascade.released {
            self.make_ready(child, now);
        }
        cancelled
    }

    /// What a fan-out task owes: completed units at their reported cost or
    /// their share of the estimate, other units at whatever they reported.
    fn fan_out_charge(&self, logical_id: &TaskId) -> Option<f64> {
        let task = self.tasks.get(logical_id)?;
        let mut charged = None;
        for unit in task.sub_tasks.iter().filter_map(|u| self.tasks.get(u)) {
            let cost = if unit.status == TaskStatus::Completed {
                unit.cost_actual.or(unit.cost_estimate)
            } else {
                unit.cost_actual
            };
            if let Some(cost) = cost {
                *charged.get_or_insert(0.0) += cost;
            }
        }
        charged
    }

    /// Move one task to `cancelled`, releasing its agent and reservation.
    ///
    /// A unit carries its cancellation to tasks that depend on it. Returns
    /// every task cancelled, empty for unknown or already terminal tasks.
    fn cancel_single(&mut self, task_id: TaskId, now: Instant) -> Vec<TaskId> {
        let fan_out_charge = self.fan_out_charge(&task_id);
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return Vec::new();
        };
        if task.is_terminal() {
            return Vec::new();
        }
        let holder = if task.status.is_in_flight() {
            task.assigned_agent.clone()
        } else {
            None
        };
        if task.transition(TaskStatus::Cancelled).is_err() {
            return Vec::new();
        }
        if task.cost_actual.is_none() {
            task.cost_actual = fan_out_charge;
        }
        let parent = task.parent_id;
        let charged = task.cost_actual.unwrap_or(0.0);

        if let Some(agent_id) = holder {
            self.registry.release(&agent_id, &task_id);
            self.outbox.push(Outbound {
                agent_id,
                message: CoordinatorMessage::TaskCancel { task_id },
            });
        }
        if parent.is_none() {
            self.admission.settle(&task_id, charged);
        }
        self.deferred.retain(|id| *id != task_id);
        self.clocks.remove(&task_id);
        self.health.forget(&task_id);
        tracing::debug!(task_id = %task_id, "task cancelled");
        self.events.push(CoordinatorEvent::TaskCancelled { task_id });

        let mut cancelled = vec![task_id];
        if parent.is_some() {
            if let Ok(cascade) = self.dag.cancel(&task_id) {
                cancelled.extend(self.propagate(cascade, now));
            }
        }
        cancelled
    }

    /// Re-run admission for deferred tasks in submission order.
    fn retry_deferred(&mut self, now: Instant) {
        let pending: Vec<TaskId> = self.deferred.drain(..).collect();
        for task_id in pending {
            let Some(task) = self.tasks.get(&task_id) else {
                continue;
            };
            if task.status != TaskStatus::Created {
                continue;
            }
            let any_capable = self.registry.any_capable(&task.required_capabilities);
            match self.admission.admit(task, any_capable) {
                AdmissionDecision::Deferred { .. } => self.deferred.push_back(task_id),
                AdmissionDecision::Rejected { kind, reason } => {
                    if let Some(task) = self.tasks.remove(&task_id) {
                        self.reject(task, kind, reason);
                    }
                }
                AdmissionDecision::Approved { estimate, advisory } => {
                    let Some(task) = self.tasks.remove(&task_id) else {
                        continue;
                    };
                    if let Err((task, e)) =
                        self.activate(task, estimate.cost, estimate.parallelism, advisory, now)
                    {
                        self.reject(task, e.kind(), e.to_string());
                    }
                }
            }
        }
    }

    fn timeout_for(&self, task: &TaskEnvelope) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.timeouts.for_agent_type(&task.agent_type))
    }

    fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}
