//! Embedded reverse tunnel listener
//!
//! Accepts agent-initiated TCP connections. The first message classifies a
//! connection: `AgentHello` opens a long-lived control channel, `DataHello`
//! redeems an activation token and becomes the endpoint's data channel.

use crate::manager::TunnelManager;
use crate::{codec, AgentConn};
use fleetgate_types::{decode_message, encode_message, ControlMessage, EndpointId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_QUEUE_DEPTH: usize = 64;

/// TCP listener for agent control and data connections.
pub struct TunnelServer {
    manager: Arc<TunnelManager>,
    listener: TcpListener,
}

impl TunnelServer {
    /// Bind the listener. Use port 0 to let the OS pick one (tests).
    pub async fn bind(manager: Arc<TunnelManager>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { manager, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the manager shuts down.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "tunnel listener started"),
            Err(_) => info!("tunnel listener started"),
        }

        let shutdown = self.manager.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("tunnel listener accept failed: {}", e);
                            continue;
                        }
                    };
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        handle_connection(manager, stream, peer).await;
                    });
                }
            }
        }
        debug!("tunnel listener stopped");
    }
}

async fn handle_connection(manager: Arc<TunnelManager>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(stream, codec());

    let first = match timeout(FIRST_MESSAGE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(buf))) => buf,
        Ok(Some(Err(e))) => {
            warn!(%peer, "failed to read first frame: {}", e);
            return;
        }
        Ok(None) => {
            debug!(%peer, "connection closed before first message");
            return;
        }
        Err(_) => {
            warn!(%peer, "timed out waiting for first message");
            return;
        }
    };

    let message = match decode_message(&first) {
        Ok(message) => message,
        Err(e) => {
            warn!(%peer, "undecodable first message: {}", e);
            return;
        }
    };

    match message {
        ControlMessage::AgentHello {
            endpoint_id,
            node_name,
            agent_version,
        } => {
            info!(
                endpoint_id = %endpoint_id,
                node = %node_name,
                version = %agent_version,
                %peer,
                "agent control channel opened"
            );
            handle_control_channel(manager, framed, endpoint_id).await;
        }
        ControlMessage::DataHello { token } => {
            manager.attach_data_channel(&token, framed).await;
        }
        other => {
            warn!(%peer, "unexpected first message: {:?}", other);
            if let Ok(payload) = encode_message(&ControlMessage::Disconnect {
                reason: "invalid first message".to_string(),
            }) {
                let _ = framed.send(payload).await;
            }
        }
    }
}

async fn handle_control_channel(
    manager: Arc<TunnelManager>,
    framed: AgentConn,
    endpoint_id: EndpointId,
) {
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let payload = match encode_message(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode control message: {}", e);
                    continue;
                }
            };
            if sink.send(payload).await.is_err() {
                break;
            }
        }
    });

    manager
        .register_control_channel(endpoint_id, tx.clone())
        .await;

    let hello_ack = ControlMessage::HelloAck {
        heartbeat_interval_secs: manager.options().heartbeat_interval.as_secs(),
        pending_jobs: manager.pending_jobs(endpoint_id).await,
    };
    if tx.send(hello_ack).await.is_err() {
        manager.on_agent_disconnect(endpoint_id, &tx).await;
        return;
    }

    let shutdown = manager.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = tx
                    .send(ControlMessage::Disconnect {
                        reason: "control plane shutting down".to_string(),
                    })
                    .await;
                break;
            }
            next = stream.next() => match next {
                Some(Ok(buf)) => match decode_message(&buf) {
                    Ok(ControlMessage::Heartbeat { timestamp }) => {
                        let _ = tx.send(ControlMessage::HeartbeatAck { timestamp }).await;
                    }
                    Ok(ControlMessage::Disconnect { reason }) => {
                        debug!(endpoint_id = %endpoint_id, reason = %reason, "agent requested disconnect");
                        break;
                    }
                    Ok(other) => {
                        warn!(endpoint_id = %endpoint_id, "unexpected control message: {:?}", other);
                    }
                    Err(e) => {
                        warn!(endpoint_id = %endpoint_id, "undecodable control message: {}", e);
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!(endpoint_id = %endpoint_id, "control channel error: {}", e);
                    break;
                }
                None => {
                    debug!(endpoint_id = %endpoint_id, "control channel closed by agent");
                    break;
                }
            }
        }
    }

    manager.on_agent_disconnect(endpoint_id, &tx).await;
    drop(tx);
    let _ = writer.await;
}
