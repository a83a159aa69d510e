use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency from {from} to {to} would create a cycle")]
    CyclicDependency { from: TaskId, to: TaskId },

    #[error("Cost rejected: {reason}")]
    CostRejected { reason: String },

    #[error("No eligible agent for capabilities [{capabilities}]")]
    NoEligibleAgent { capabilities: String },

    #[error("Agent unreachable: {id}")]
    AgentUnreachable { id: AgentId },

    #[error("Task {id} timed out after {elapsed:?}")]
    TaskTimeout {
        id: TaskId,
        elapsed: std::time::Duration,
    },

    #[error("Task {id} failed: sub-tasks {failed:?} exhausted retries")]
    SubtaskFailure { id: TaskId, failed: Vec<usize> },

    #[error("Agent already registered: {id}")]
    DuplicateAgent { id: AgentId },

    #[error("Agent not found: {id}")]
    UnknownAgent { id: AgentId },

    #[error("Task not found: {id}")]
    TaskNotFound { id: TaskId },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Coordinator channel closed")]
    ChannelClosed,

    #[error("Blocking task failed: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Classify the error for callers and task records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::CostRejected { .. } => ErrorKind::CostRejected,
            Error::NoEligibleAgent { .. } => ErrorKind::NoEligibleAgent,
            Error::AgentUnreachable { .. } => ErrorKind::AgentUnreachable,
            Error::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Error::SubtaskFailure { .. } => ErrorKind::SubtaskFailure,
            Error::Validation(_) | Error::InvalidTransition { .. } => ErrorKind::ValidationError,
            _ => ErrorKind::Internal,
        }
    }
}

/// Error classification surfaced to callers alongside failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CyclicDependency,
    CostRejected,
    NoEligibleAgent,
    AgentUnreachable,
    TaskTimeout,
    SubtaskFailure,
    ValidationError,
    /// Failure reported by the executing agent itself.
    AgentError,
    Internal,
}

impl ErrorKind {
    /// Transient kinds consume retry budget instead of failing the task outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoEligibleAgent
                | ErrorKind::AgentUnreachable
                | ErrorKind::TaskTimeout
                | ErrorKind::SubtaskFailure
                | ErrorKind::AgentError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::CostRejected => "cost_rejected",
            ErrorKind::NoEligibleAgent => "no_eligible_agent",
            ErrorKind::AgentUnreachable => "agent_unreachable",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::SubtaskFailure => "subtask_failure",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AgentError => "agent_error",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
