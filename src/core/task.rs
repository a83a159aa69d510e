//! Task envelope data model.
//!
//! A `TaskEnvelope` is the unit of work routed to agents: a fixed header
//! (identity, parentage, capabilities, parallelism, dependencies, status)
//! plus an opaque payload interpreted only by the executing agent.

use crate::agent::{AgentId, CapabilitySet};
use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Admitted,
    Rejected,
    /// Admitted but at least one dependency has not completed.
    Waiting,
    Ready,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the task is assigned to an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    /// Legal edges of the task state machine.
    ///
    /// `dispatched|running -> ready` covers reassignment and retry,
    /// `ready -> running` is taken by fanned-out logical tasks, and
    /// `ready -> waiting` by a task that gained an unmet dependency.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Created, Admitted | Rejected | Cancelled) => true,
            (Admitted, Waiting | Ready | Cancelled) => true,
            (Waiting, Ready | Cancelled) => true,
            (Ready, Waiting | Dispatched | Running | Failed | Cancelled) => true,
            (Dispatched, Running | Ready | Completed | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Ready) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Admitted => "admitted",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Kind tag of a payload. Only the consuming agent knows the body's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Search,
    Analysis,
    Synthesis,
    Custom(String),
}

/// Opaque task payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadKind,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Payload {
    pub fn new(kind: PayloadKind, body: serde_json::Value) -> Self {
        Self { kind, body }
    }

    /// Serialized size of the body in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.body).map(|v| v.len()).unwrap_or(0)
    }
}

/// Last error recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    /// Owning logical task for fan-out units.
    pub parent_id: Option<TaskId>,
    /// Session or conversation the task belongs to.
    pub context_id: String,
    pub agent_type: String,
    pub required_capabilities: CapabilitySet,
    pub payload: Payload,
    pub parallelism: u32,
    /// Tasks that must complete before this one becomes ready.
    pub dependencies: Vec<TaskId>,
    /// Tasks listing this one as a dependency.
    #[serde(default)]
    pub children: Vec<TaskId>,
    /// Fan-out units, in creation order.
    #[serde(default)]
    pub sub_tasks: Vec<TaskId>,
    /// Position among siblings for fan-out units.
    pub unit_index: Option<usize>,
    /// Treat failed dependencies as resolved instead of cascading.
    #[serde(default)]
    pub failure_tolerant: bool,
    /// Caller override of the per-agent-type timeout.
    pub timeout_secs: Option<u64>,
    pub status: TaskStatus,
    pub cost_estimate: Option<f64>,
    pub cost_actual: Option<f64>,
    /// Admission crossed the warning threshold.
    #[serde(default)]
    pub advisory: bool,
    pub assigned_agent: Option<AgentId>,
    #[serde(default)]
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    /// Create a root task with parallelism 1 and no dependencies.
    pub fn new(context_id: &str, agent_type: &str, payload: Payload) -> Self {
        Self {
            id: TaskId::new(),
            parent_id: None,
            context_id: context_id.to_string(),
            agent_type: agent_type.to_string(),
            required_capabilities: std::iter::once(agent_type).collect(),
            payload,
            parallelism: 1,
            dependencies: Vec::new(),
            children: Vec::new(),
            sub_tasks: Vec::new(),
            unit_index: None,
            failure_tolerant: false,
            timeout_secs: None,
            status: TaskStatus::Created,
            cost_estimate: None,
            cost_actual: None,
            advisory: false,
            assigned_agent: None,
            attempts: 0,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            admitted_at: None,
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn failure_tolerant(mut self) -> Self {
        self.failure_tolerant = true;
        self
    }

    /// Build the fan-out unit at `index` for this logical task.
    ///
    /// Units inherit payload, context and capabilities, get a fresh id,
    /// and carry no dependencies of their own.
    pub fn sub_task(&self, index: usize) -> Self {
        let mut unit = TaskEnvelope::new(&self.context_id, &self.agent_type, self.payload.clone())
            .with_capabilities(self.required_capabilities.clone());
        unit.parent_id = Some(self.id);
        unit.unit_index = Some(index);
        unit.timeout_secs = self.timeout_secs;
        unit.failure_tolerant = self.failure_tolerant;
        unit
    }

    pub fn is_logical_fan_out(&self) -> bool {
        self.parallelism > 1
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reject malformed envelopes before they reach any component.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Validation("parallelism must be >= 1".to_string()));
        }
        if self.context_id.trim().is_empty() {
            return Err(Error::Validation("context_id must not be empty".to_string()));
        }
        if self.agent_type.trim().is_empty() {
            return Err(Error::Validation("agent_type must not be empty".to_string()));
        }
        if self.required_capabilities.is_empty() {
            return Err(Error::Validation(
                "required_capabilities must not be empty".to_string(),
            ));
        }
        if self.dependencies.contains(&self.id) {
            return Err(Error::CyclicDependency {
                from: self.id,
                to: self.id,
            });
        }
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep) {
                return Err(Error::Validation(format!("duplicate dependency {}", dep)));
            }
        }
        if self.parent_id == Some(self.id) {
            return Err(Error::Validation("task cannot be its own parent".to_string()));
        }
        Ok(())
    }

    /// Move to `to`, stamping the matching timestamp.
    ///
    /// Illegal transitions leave the task untouched.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        match to {
            TaskStatus::Admitted => self.admitted_at = Some(now),
            TaskStatus::Dispatched => self.dispatched_at = Some(now),
            TaskStatus::Ready => self.assigned_agent = None,
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Record a failure and move to `failed`.
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }
}
