//! Message loop around the coordinator.
//!
//! The `CoordinatorActor` is a single tokio task that owns the
//! [`Coordinator`]. Everything that mutates orchestration state reaches it
//! as a message:
//! - caller requests through a [`CoordinatorHandle`] (submit, status,
//!   result, cancel, stats, snapshot), each answered on a oneshot channel;
//! - agent traffic through an [`AgentConnection`] (registration,
//!   heartbeats, results, disconnects);
//! - a periodic sweep tick for heartbeat and timeout monitoring.
//!
//! After each message the actor routes queued agent messages to their
//! connections and broadcasts lifecycle events to subscribers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, CapabilitySet};
use crate::config::Config;
use crate::core::task::{TaskEnvelope, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::coordinator::{
    Coordinator, CoordinatorEvent, QueueStats, SubmitReceipt, TaskOutcome, TaskReport, TaskView,
};
use crate::protocol::{AgentMessage, CoordinatorMessage};
use crate::state::{Snapshot, StateStore};

const EVENT_CAPACITY: usize = 1024;
const AGENT_EVENT_CAPACITY: usize = 1024;

/// Requests from callers, each carrying its reply channel.
enum Command {
    Submit {
        task: TaskEnvelope,
        reply: oneshot::Sender<SubmitReceipt>,
    },
    AddDependency {
        task: TaskId,
        depends_on: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        task_id: TaskId,
        reply: oneshot::Sender<Result<TaskView>>,
    },
    Result {
        task_id: TaskId,
        reply: oneshot::Sender<Result<Option<TaskOutcome>>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<Vec<TaskId>>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Traffic from agent connections.
enum AgentEvent {
    /// A connection completed the `agent_register` handshake.
    Register {
        agent_id: AgentId,
        agent_type: String,
        capabilities: CapabilitySet,
        max_concurrent: usize,
        reply: oneshot::Sender<Result<AgentConnection>>,
    },
    /// Any message after registration.
    Message {
        connection: u64,
        message: AgentMessage,
    },
    /// The connection closed.
    Closed { agent_id: AgentId, connection: u64 },
}

/// Sending half kept by the actor for each registered connection.
struct ConnectionSlot {
    id: u64,
    outbound: mpsc::UnboundedSender<CoordinatorMessage>,
}

/// A registered agent's side of the actor.
///
/// Created by [`CoordinatorHandle::register_agent`]. The transport forwards
/// inbound messages with [`AgentConnection::send`] and writes whatever
/// [`AgentConnection::recv`] yields back to the agent. Dropping the
/// connection without calling [`AgentConnection::close`] leaves the agent
/// registered until heartbeat eviction.
pub struct AgentConnection {
    agent_id: AgentId,
    id: u64,
    events: mpsc::Sender<AgentEvent>,
    outbound: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

impl AgentConnection {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Forward a message received from the agent.
    pub async fn send(&self, message: AgentMessage) -> Result<()> {
        self.events
            .send(AgentEvent::Message {
                connection: self.id,
                message,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Next message for the agent. `None` once the actor has stopped.
    pub async fn recv(&mut self) -> Option<CoordinatorMessage> {
        self.outbound.recv().await
    }

    /// Report the connection closed; the agent is deregistered.
    pub async fn close(self) {
        let _ = self
            .events
            .send(AgentEvent::Closed {
                agent_id: self.agent_id,
                connection: self.id,
            })
            .await;
    }
}

/// Cloneable caller handle to a running actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    agent_events: mpsc::Sender<AgentEvent>,
    events: broadcast::Sender<CoordinatorEvent>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn submit(&self, task: TaskEnvelope) -> Result<SubmitReceipt> {
        self.request(|reply| Command::Submit { task, reply }).await
    }

    pub async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<()> {
        self.request(|reply| Command::AddDependency {
            task,
            depends_on,
            reply,
        })
        .await?
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskView> {
        self.request(|reply| Command::Status { task_id, reply })
            .await?
    }

    /// The outcome of a task, `None` until it is terminal.
    pub async fn result(&self, task_id: TaskId) -> Result<Option<TaskOutcome>> {
        self.request(|reply| Command::Result { task_id, reply })
            .await?
    }

    /// Cancel a task; returns every task cancelled as a consequence.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.request(|reply| Command::Cancel { task_id, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Register an agent and open its message channel.
    ///
    /// `register_ack` is the first message the connection yields.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        agent_type: String,
        capabilities: CapabilitySet,
        max_concurrent: usize,
    ) -> Result<AgentConnection> {
        let (reply, rx) = oneshot::channel();
        self.agent_events
            .send(AgentEvent::Register {
                agent_id,
                agent_type,
                capabilities,
                max_concurrent,
                reply,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Signal the actor to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled on shutdown, for tasks that should stop with the actor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct CoordinatorActor {
    coordinator: Coordinator,
    sweep_interval: Duration,
    inbox_capacity: usize,
    store: Option<StateStore>,
    connections: HashMap<AgentId, ConnectionSlot>,
    /// Connection id to agent, for routing inbound messages.
    owners: HashMap<u64, AgentId>,
    next_connection: u64,
}

impl CoordinatorActor {
    pub fn new(config: &Config) -> Self {
        let coordinator = Coordinator::new(config);
        let sweep_interval = coordinator.health().sweep_interval();
        Self {
            coordinator,
            sweep_interval,
            inbox_capacity: config.server.inbox_capacity.max(1),
            store: config.state.snapshot_path().map(StateStore::new),
            connections: HashMap::new(),
            owners: HashMap::new(),
            next_connection: 0,
        }
    }

    /// Write a snapshot here when the actor stops.
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(self.inbox_capacity);
        let (agent_tx, agent_rx) = mpsc::channel(AGENT_EVENT_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = CoordinatorHandle {
            commands: command_tx,
            agent_events: agent_tx.clone(),
            events: event_tx.clone(),
            cancel: cancel.clone(),
        };

        tracing::debug!(sweep_ms = self.sweep_interval.as_millis() as u64, "CoordinatorActor::spawn");
        let join = tokio::spawn(self.run(cancel, command_rx, agent_rx, agent_tx, event_tx));
        (handle, join)
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::Receiver<Command>,
        mut agent_events: mpsc::Receiver<AgentEvent>,
        agent_tx: mpsc::Sender<AgentEvent>,
        events: broadcast::Sender<CoordinatorEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("CoordinatorActor cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("CoordinatorActor: all handles dropped");
                        break;
                    }
                },
                Some(event) = agent_events.recv() => self.handle_agent_event(event, &agent_tx),
                _ = sweep.tick() => self.coordinator.sweep_at(now()),
            }
            self.flush(&events);
        }

        if let Some(store) = &self.store {
            let snapshot = self.coordinator.snapshot();
            if let Err(e) = store.save_async(snapshot).await {
                tracing::error!(path = %store.path().display(), error = %e, "failed to write snapshot");
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Submit { task, reply } => {
                let _ = reply.send(self.coordinator.submit(task, now));
            }
            Command::AddDependency {
                task,
                depends_on,
                reply,
            } => {
                let _ = reply.send(self.coordinator.add_dependency(task, depends_on, now));
            }
            Command::Status { task_id, reply } => {
                let _ = reply.send(self.coordinator.status(&task_id));
            }
            Command::Result { task_id, reply } => {
                let _ = reply.send(self.coordinator.result(&task_id));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.coordinator.cancel(task_id, now));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.coordinator.stats());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.coordinator.snapshot());
            }
        }
    }

    fn handle_agent_event(&mut self, event: AgentEvent, agent_tx: &mpsc::Sender<AgentEvent>) {
        let now = now();
        match event {
            AgentEvent::Register {
                agent_id,
                agent_type,
                capabilities,
                max_concurrent,
                reply,
            } => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                // The ack goes out before any task_submit the registration triggers.
                let _ = outbound_tx.send(CoordinatorMessage::RegisterAck {
                    agent_id: agent_id.clone(),
                });
                let result = self
                    .coordinator
                    .register(agent_id.clone(), &agent_type, capabilities, max_concurrent, now)
                    .map(|()| {
                        self.next_connection += 1;
                        let id = self.next_connection;
                        self.connections.insert(
                            agent_id.clone(),
                            ConnectionSlot {
                                id,
                                outbound: outbound_tx,
                            },
                        );
                        self.owners.insert(id, agent_id.clone());
                        tracing::info!(agent_id = %agent_id, agent_type = %agent_type, "agent registered");
                        AgentConnection {
                            agent_id: agent_id.clone(),
                            id,
                            events: agent_tx.clone(),
                            outbound: outbound_rx,
                        }
                    });
                if let Err(e) = &result {
                    tracing::warn!(agent_id = %agent_id, error = %e, "registration rejected");
                }
                let _ = reply.send(result);
            }
            AgentEvent::Message {
                connection,
                message,
            } => {
                let Some(agent_id) = self.owners.get(&connection).cloned() else {
                    return;
                };
                if message.agent_id() != &agent_id {
                    tracing::warn!(
                        agent_id = %agent_id,
                        claimed = %message.agent_id(),
                        "message names a different agent, ignoring"
                    );
                    return;
                }
                self.handle_agent_message(&agent_id, message, now);
            }
            AgentEvent::Closed {
                agent_id,
                connection,
            } => {
                self.owners.remove(&connection);
                let current = self
                    .connections
                    .get(&agent_id)
                    .map(|slot| slot.id == connection)
                    .unwrap_or(false);
                if current {
                    self.connections.remove(&agent_id);
                    self.coordinator.deregister(&agent_id, now);
                }
            }
        }
    }

    fn handle_agent_message(&mut self, agent_id: &AgentId, message: AgentMessage, now: std::time::Instant) {
        match message {
            AgentMessage::AgentRegister { .. } => {
                tracing::warn!(agent_id = %agent_id, "duplicate agent_register on open connection");
            }
            AgentMessage::Heartbeat { current_load, .. } => {
                let reply = match self.coordinator.heartbeat(agent_id, current_load, now) {
                    Ok(()) => CoordinatorMessage::HeartbeatAck,
                    Err(e) => CoordinatorMessage::HeartbeatReject {
                        reason: e.to_string(),
                    },
                };
                self.send_to(agent_id, reply);
            }
            AgentMessage::TaskStarted { task_id, .. } => {
                self.coordinator.task_started(agent_id, &task_id);
            }
            AgentMessage::TaskResult {
                task_id,
                status,
                result,
                error,
                processing_time_ms,
                cost,
                ..
            } => {
                let report = TaskReport {
                    status,
                    result,
                    error,
                    processing_time: Duration::from_millis(processing_time_ms),
                    cost,
                };
                self.coordinator.handle_result(agent_id, &task_id, report, now);
            }
        }
    }

    fn send_to(&self, agent_id: &AgentId, message: CoordinatorMessage) {
        match self.connections.get(agent_id) {
            Some(slot) => {
                if slot.outbound.send(message).is_err() {
                    tracing::debug!(agent_id = %agent_id, "connection writer gone");
                }
            }
            None => tracing::debug!(agent_id = %agent_id, "no connection for outbound message"),
        }
    }

    fn flush(&mut self, events: &broadcast::Sender<CoordinatorEvent>) {
        for outbound in self.coordinator.drain_outbox() {
            self.send_to(&outbound.agent_id, outbound.message);
        }
        for event in self.coordinator.drain_events() {
            // No subscribers is fine.
            let _ = events.send(event);
        }
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
