//! TCP listener for agent connections.
//!
//! Each connection carries newline-delimited JSON in both directions. The
//! first line must be `agent_register`; anything else gets a
//! `register_reject` and the connection is closed. After registration,
//! malformed lines are logged and skipped, and closing the socket
//! deregisters the agent.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::agent::CapabilitySet;
use crate::error::{Error, Result};
use crate::orchestration::actor::{AgentConnection, CoordinatorHandle};
use crate::protocol::{AgentMessage, CoordinatorMessage};

/// Longest accepted line. Payloads are opaque, so this is generous.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

type Lines = Framed<TcpStream, LinesCodec>;

pub struct AgentListener {
    listener: TcpListener,
    handle: CoordinatorHandle,
}

impl AgentListener {
    pub async fn bind(addr: &str, handle: CoordinatorHandle) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for agents");
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the coordinator shuts down.
    pub async fn run(self) {
        let cancel = self.handle.cancellation_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("AgentListener cancelled");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "agent connection accepted");
                        let handle = self.handle.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, handle, cancel).await;
                            tracing::debug!(%peer, "agent connection closed");
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                },
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, handle: CoordinatorHandle, cancel: CancellationToken) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let Some(mut connection) = handshake(&mut lines, &handle).await else {
        return;
    };
    let agent_id = connection.agent_id().clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = lines.next() => match inbound {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::trace!(agent_id = %agent_id, %line, "recv");
                    match AgentMessage::from_line(&line) {
                        Ok(message) => {
                            if connection.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "skipping malformed line");
                        }
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(agent_id = %agent_id, "skipping oversized line");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "read failed");
                    break;
                }
                None => break,
            },
            outbound = connection.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = write_message(&mut lines, &message).await {
                        tracing::error!(agent_id = %agent_id, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    connection.close().await;
}

/// Read the registration line and register the agent.
///
/// Returns `None` when the connection should be closed.
async fn handshake(lines: &mut Lines, handle: &CoordinatorHandle) -> Option<AgentConnection> {
    let first = loop {
        match lines.next().await? {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => break line,
            Err(e) => {
                tracing::warn!(error = %e, "connection failed before registration");
                return None;
            }
        }
    };

    let registration = match AgentMessage::from_line(&first) {
        Ok(AgentMessage::AgentRegister {
            agent_id,
            agent_type,
            capabilities,
            max_concurrent,
        }) => {
            let capabilities: CapabilitySet = capabilities.into_iter().collect();
            handle
                .register_agent(agent_id, agent_type, capabilities, max_concurrent)
                .await
        }
        Ok(_) => Err(Error::Validation(
            "first message must be agent_register".to_string(),
        )),
        Err(e) => Err(e),
    };

    match registration {
        Ok(connection) => Some(connection),
        Err(e) => {
            tracing::warn!(error = %e, "rejecting agent connection");
            let reject = CoordinatorMessage::RegisterReject {
                reason: e.to_string(),
            };
            let _ = write_message(lines, &reject).await;
            None
        }
    }
}

async fn write_message(lines: &mut Lines, message: &CoordinatorMessage) -> Result<()> {
    let line = message.to_line()?;
    tracing::trace!(%line, "send");
    lines.send(line).await.map_err(codec_error)
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Validation("line exceeds maximum length".to_string())
        }
    }
}
