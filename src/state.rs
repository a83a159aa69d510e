//! Snapshot persistence.
//!
//! A snapshot captures the task table, cost ledgers and connected agents
//! at one instant. It is informational: `conductor status` reads it, the
//! coordinator never resumes in-flight work from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::{AgentId, AgentRecord, AgentStatus};
use crate::core::task::{TaskEnvelope, TaskStatus};
use crate::orchestration::admission::SessionLedger;
use crate::orchestration::coordinator::QueueStats;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub current_load: usize,
    pub max_concurrent: usize,
}

impl From<&AgentRecord> for AgentSnapshot {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.id.clone(),
            agent_type: record.agent_type.clone(),
            status: record.status,
            current_load: record.current_load(),
            max_concurrent: record.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: Vec<TaskEnvelope>,
    pub ledgers: Vec<SessionLedger>,
    #[serde(default)]
    pub agents: Vec<AgentSnapshot>,
    pub global_cost: f64,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Queue statistics as of the snapshot.
    pub fn stats(&self) -> QueueStats {
        let mut tasks_by_status = BTreeMap::new();
        for task in &self.tasks {
            *tasks_by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        let mut agents_by_status = BTreeMap::new();
        for agent in &self.agents {
            *agents_by_status.entry(agent.status.to_string()).or_insert(0) += 1;
        }
        QueueStats {
            tasks_by_status,
            agents_by_status,
            ready_queue: self.count(TaskStatus::Ready),
            deferred: self.count(TaskStatus::Created),
            global_cost: self.global_cost,
            sessions: self.ledgers.clone(),
        }
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Reads and writes snapshots at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or `None` if none has been written.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        tracing::debug!(path = %self.path.display(), "loading snapshot");
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write the snapshot through a temp file and rename it into place.
    ///
    /// The previous snapshot is kept as `<name>.bak`.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }

        let contents = serde_json::to_string_pretty(snapshot)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            tasks = snapshot.tasks.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// `save` on the blocking pool.
    pub async fn save_async(&self, snapshot: Snapshot) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}
