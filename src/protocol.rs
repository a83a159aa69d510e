//! Messages exchanged with agents.
//!
//! Every message is a JSON object tagged by `"type"`, one object per line.

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::core::task::{Payload, TaskEnvelope, TaskId};
use crate::error::Result;

/// How an agent reports the end of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Completed,
    Failed,
}

/// Agent to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    AgentRegister {
        agent_id: AgentId,
        agent_type: String,
        capabilities: Vec<String>,
        max_concurrent: usize,
    },
    Heartbeat {
        agent_id: AgentId,
        #[serde(default)]
        current_load: usize,
    },
    /// Optional notice that execution began.
    TaskStarted { task_id: TaskId, agent_id: AgentId },
    TaskResult {
        task_id: TaskId,
        agent_id: AgentId,
        status: TaskResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        processing_time_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
    },
}

impl AgentMessage {
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The agent id carried by the message.
    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentMessage::AgentRegister { agent_id, .. }
            | AgentMessage::Heartbeat { agent_id, .. }
            | AgentMessage::TaskStarted { agent_id, .. }
            | AgentMessage::TaskResult { agent_id, .. } => agent_id,
        }
    }
}

/// Coordinator to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    RegisterAck {
        agent_id: AgentId,
    },
    RegisterReject {
        reason: String,
    },
    HeartbeatAck,
    HeartbeatReject {
        reason: String,
    },
    TaskSubmit {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<TaskId>,
        context_id: String,
        agent_type: String,
        payload: Payload,
        parallelism: u32,
        #[serde(default)]
        dependencies: Vec<TaskId>,
    },
    TaskCancel {
        task_id: TaskId,
    },
}

impl CoordinatorMessage {
    pub fn submit(task: &TaskEnvelope) -> Self {
        CoordinatorMessage::TaskSubmit {
            task_id: task.id,
            parent_id: task.parent_id,
            context_id: task.context_id.clone(),
            agent_type: task.agent_type.clone(),
            payload: task.payload.clone(),
            parallelism: task.parallelism,
            dependencies: task.dependencies.clone(),
        }
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
