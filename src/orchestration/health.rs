//! Heartbeat and timeout monitoring.
//!
//! The `HealthMonitor` runs one sweep per tick of the coordinator actor.
//! A sweep:
//! - updates agent liveness from heartbeat age and evicts agents that
//!   missed too many intervals, surfacing their in-flight tasks;
//! - reports dispatched or running tasks whose elapsed time exceeds their
//!   timeout;
//! - reports ready tasks that found no eligible agent before their timeout.
//!
//! It also owns the retry bookkeeping: every failed attempt goes through
//! [`HealthMonitor::record_failure`], which applies the retry policy.

use crate::agent::AgentId;
use crate::core::task::TaskId;
use crate::orchestration::registry::{AgentRegistry, LivenessConfig};
use crate::orchestration::retry::RetryPolicy;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Events produced by a sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// An agent missed the heartbeat window and was removed from the registry.
    AgentEvicted {
        agent_id: AgentId,
        /// Tasks the agent held, to be returned to `ready`.
        in_flight: Vec<TaskId>,
    },
    /// A dispatched or running task exceeded its timeout.
    TaskTimedOut {
        task_id: TaskId,
        agent_id: Option<AgentId>,
        elapsed: Duration,
    },
    /// A ready task found no eligible agent before its timeout.
    ReadyExpired { task_id: TaskId, waited: Duration },
}

/// A timer the coordinator wants checked.
#[derive(Debug, Clone)]
pub struct Deadline {
    pub task_id: TaskId,
    /// Agent holding the task; `None` while the task waits in `ready`.
    pub agent_id: Option<AgentId>,
    /// When the clock for this deadline started.
    pub since: Instant,
    pub timeout: Duration,
}

impl Deadline {
    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.timeout
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Re-queue the task, not before `backoff` has passed.
    Retry { attempt: u32, backoff: Duration },
    /// The retry budget is spent.
    Exhausted { attempts: u32 },
}

/// Tracks failed attempts per task.
///
/// # Example
///
/// ```
/// use conductor::core::task::TaskId;
/// use conductor::orchestration::RetryTracker;
///
/// let mut tracker = RetryTracker::new();
/// let task_id = TaskId::new();
///
/// assert_eq!(tracker.get_retries(&task_id), 0);
/// tracker.increment(&task_id);
/// assert_eq!(tracker.get_retries(&task_id), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts recorded for a task, 0 if none.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Record one more failed attempt and return the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(*task_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn clear(&mut self) {
        self.retries.clear();
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

pub struct HealthMonitor {
    liveness: LivenessConfig,
    policy: RetryPolicy,
    retry_tracker: RetryTracker,
}

impl HealthMonitor {
    pub fn new(liveness: LivenessConfig, policy: RetryPolicy) -> Self {
        Self {
            liveness,
            policy,
            retry_tracker: RetryTracker::new(),
        }
    }

    /// Period between sweeps: half the heartbeat interval.
    pub fn sweep_interval(&self) -> Duration {
        (self.liveness.heartbeat_interval / 2).max(Duration::from_millis(10))
    }

    /// Run one sweep at `now`.
    ///
    /// Evictions come first; deadlines held by an evicted agent are skipped
    /// because eviction already returns those tasks to `ready`.
    pub fn sweep(
        &self,
        registry: &mut AgentRegistry,
        deadlines: &[Deadline],
        now: Instant,
    ) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        let mut evicted = HashSet::new();

        for agent_id in registry.refresh_liveness(now, &self.liveness) {
            if let Some(record) = registry.deregister(&agent_id) {
                tracing::warn!(
                    agent_id = %agent_id,
                    in_flight = record.current_load(),
                    "evicting agent after missed heartbeats"
                );
                evicted.insert(agent_id.clone());
                events.push(HealthEvent::AgentEvicted {
                    agent_id,
                    in_flight: record.in_flight.into_iter().collect(),
                });
            }
        }

        for deadline in deadlines.iter().filter(|d| d.is_expired(now)) {
            match &deadline.agent_id {
                Some(agent_id) if evicted.contains(agent_id) => continue,
                Some(agent_id) => {
                    tracing::warn!(
                        task_id = %deadline.task_id,
                        agent_id = %agent_id,
                        elapsed_ms = deadline.elapsed(now).as_millis() as u64,
                        "task timed out"
                    );
                    events.push(HealthEvent::TaskTimedOut {
                        task_id: deadline.task_id,
                        agent_id: Some(agent_id.clone()),
                        elapsed: deadline.elapsed(now),
                    });
                }
                None => {
                    tracing::warn!(
                        task_id = %deadline.task_id,
                        "no eligible agent before timeout"
                    );
                    events.push(HealthEvent::ReadyExpired {
                        task_id: deadline.task_id,
                        waited: deadline.elapsed(now),
                    });
                }
            }
        }

        events
    }

    /// Count a failed attempt and decide whether it may be retried.
    pub fn record_failure(&mut self, task_id: &TaskId) -> RetryVerdict {
        let attempts = self.retry_tracker.increment(task_id);
        if self.policy.allows_retry(attempts) {
            RetryVerdict::Retry {
                attempt: attempts,
                backoff: self.policy.backoff(attempts),
            }
        } else {
            RetryVerdict::Exhausted { attempts }
        }
    }

    pub fn attempts(&self, task_id: &TaskId) -> u32 {
        self.retry_tracker.get_retries(task_id)
    }

    /// Drop retry bookkeeping for a terminal task.
    pub fn forget(&mut self, task_id: &TaskId) {
        self.retry_tracker.reset(task_id);
    }
}
