//! End-to-end tests over TCP.
//!
//! These tests run the coordinator actor and the agent listener on a real
//! socket and drive them with scripted agents speaking the line protocol.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_util::codec::{Framed, LinesCodec};

use conductor::agent::AgentId;
use conductor::core::task::TaskStatus;
use conductor::orchestration::{CoordinatorActor, CoordinatorEvent, CoordinatorHandle};
use conductor::protocol::{AgentMessage, CoordinatorMessage, TaskResultStatus};
use conductor::state::StateStore;
use conductor::transport::AgentListener;

use crate::fixtures::{search_task, test_config};

const WAIT: Duration = Duration::from_secs(5);

type Lines = Framed<TcpStream, LinesCodec>;

async fn send(lines: &mut Lines, message: AgentMessage) {
    lines.send(message.to_line().unwrap()).await.unwrap();
}

async fn recv(lines: &mut Lines) -> Option<CoordinatorMessage> {
    let line = lines.next().await?.ok()?;
    Some(CoordinatorMessage::from_line(&line).unwrap())
}

/// Connect, register and heartbeat, then complete every submitted task.
///
/// `ready` fires once the heartbeat is acknowledged.
async fn scripted_agent(addr: SocketAddr, id: &'static str, ready: oneshot::Sender<()>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    let agent_id = AgentId::from(id);

    send(
        &mut lines,
        AgentMessage::AgentRegister {
            agent_id: agent_id.clone(),
            agent_type: "search".to_string(),
            capabilities: vec!["search".to_string()],
            max_concurrent: 2,
        },
    )
    .await;
    assert_eq!(
        recv(&mut lines).await,
        Some(CoordinatorMessage::RegisterAck {
            agent_id: agent_id.clone()
        })
    );

    send(
        &mut lines,
        AgentMessage::Heartbeat {
            agent_id: agent_id.clone(),
            current_load: 0,
        },
    )
    .await;
    assert_eq!(recv(&mut lines).await, Some(CoordinatorMessage::HeartbeatAck));
    let _ = ready.send(());

    while let Some(message) = recv(&mut lines).await {
        let CoordinatorMessage::TaskSubmit { task_id, .. } = message else {
            continue;
        };
        send(
            &mut lines,
            AgentMessage::TaskStarted {
                task_id,
                agent_id: agent_id.clone(),
            },
        )
        .await;
        send(
            &mut lines,
            AgentMessage::TaskResult {
                task_id,
                agent_id: agent_id.clone(),
                status: TaskResultStatus::Completed,
                result: Some(json!({ "agent": id })),
                error: None,
                processing_time_ms: 12,
                cost: Some(0.1),
            },
        )
        .await;
    }
}

async fn start(store: StateStore) -> (CoordinatorHandle, tokio::task::JoinHandle<()>, SocketAddr) {
    let (handle, join) = CoordinatorActor::new(&test_config())
        .with_state_store(store)
        .spawn();
    let listener = AgentListener::bind("127.0.0.1:0", handle.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    (handle, join, addr)
}

/// Test: A fan-out task completes across two remote agents
/// Given two scripted agents connected over TCP
/// When a task with parallelism 2 is submitted through the handle
/// Then both units run on the agents and the logical task completes with both results
#[tokio::test]
async fn test_fan_out_over_tcp() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let (handle, join, addr) = start(store.clone()).await;

    let mut ready = Vec::new();
    for id in ["w1", "w2"] {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(scripted_agent(addr, id, tx));
        ready.push(rx);
    }
    for rx in ready {
        timeout(WAIT, rx).await.unwrap().unwrap();
    }

    let mut events = handle.subscribe();
    let receipt = assert_ok!(handle.submit(search_task("s1").with_parallelism(2)).await);
    assert!(receipt.decision.is_approved());

    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if event == (CoordinatorEvent::TaskCompleted { task_id: receipt.task_id }) {
            break;
        }
    }

    let outcome = assert_ok!(handle.result(receipt.task_id).await).unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    let results = outcome.result.unwrap();
    assert_eq!(results.as_array().unwrap().len(), 2);
    assert!((outcome.cost.unwrap() - 0.2).abs() < 1e-9);

    let stats = assert_ok!(handle.stats().await);
    assert_eq!(stats.tasks_by_status.get("completed"), Some(&3));
    assert_eq!(stats.agents_by_status.values().sum::<usize>(), 2);
    assert!((stats.global_cost - 0.2).abs() < 1e-9);

    let live = assert_ok!(handle.snapshot().await);
    assert_eq!(live.tasks.len(), 3);
    assert_eq!(live.stats().tasks_by_status, stats.tasks_by_status);

    handle.shutdown();
    timeout(WAIT, join).await.unwrap().unwrap();

    let snapshot = store.load().unwrap().unwrap();
    assert_eq!(snapshot.tasks.len(), 3);
    assert_eq!(snapshot.agents.len(), 2);
    let from_disk = snapshot.stats();
    assert_eq!(from_disk.tasks_by_status.get("completed"), Some(&3));
    assert_eq!(from_disk.sessions.len(), 1);
    assert!((from_disk.sessions[0].spent - 0.2).abs() < 1e-9);
}

/// Test: Cancel reaches the agent holding the task
/// Given an agent that accepts work but never answers
/// When the caller cancels the task through the handle
/// Then the agent receives task_cancel for it
#[tokio::test]
async fn test_cancel_over_tcp() {
    let dir = tempfile::TempDir::new().unwrap();
    let (handle, join, addr) = start(StateStore::new(dir.path().join("state.json"))).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    let agent_id = AgentId::from("silent");
    send(
        &mut lines,
        AgentMessage::AgentRegister {
            agent_id: agent_id.clone(),
            agent_type: "search".to_string(),
            capabilities: vec!["search".to_string()],
            max_concurrent: 1,
        },
    )
    .await;
    timeout(WAIT, recv(&mut lines)).await.unwrap().unwrap();
    send(
        &mut lines,
        AgentMessage::Heartbeat {
            agent_id,
            current_load: 0,
        },
    )
    .await;
    timeout(WAIT, recv(&mut lines)).await.unwrap().unwrap();

    let receipt = assert_ok!(handle.submit(search_task("s1")).await);
    let submitted = timeout(WAIT, recv(&mut lines)).await.unwrap().unwrap();
    assert!(matches!(
        submitted,
        CoordinatorMessage::TaskSubmit { task_id, .. } if task_id == receipt.task_id
    ));

    let cancelled = assert_ok!(handle.cancel(receipt.task_id).await);
    assert_eq!(cancelled, vec![receipt.task_id]);
    assert_eq!(
        timeout(WAIT, recv(&mut lines)).await.unwrap(),
        Some(CoordinatorMessage::TaskCancel {
            task_id: receipt.task_id
        })
    );

    handle.shutdown();
    timeout(WAIT, join).await.unwrap().unwrap();
}
