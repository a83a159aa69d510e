//! Core domain models: task envelopes and the dependency graph.

pub mod dag;
pub mod task;

pub use dag::{CascadePolicy, DependencyTracker, EdgeKind};
pub use task::{Payload, PayloadKind, TaskEnvelope, TaskError, TaskId, TaskStatus};
