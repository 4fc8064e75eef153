//! Tunnel lifecycle manager
//!
//! Owns every tunnel state transition: activation (single-flight per
//! endpoint), data channel attachment, agent disconnects, the idle reaper
//! and process shutdown.

use crate::data_channel::{DataChannel, DataChannelHandle};
use crate::registry::{Tunnel, TunnelRegistry};
use crate::{AgentConn, TunnelError};
use fleetgate_types::{encode_message, ControlMessage, EdgeJob, EndpointId, TunnelStatus};
use futures_util::SinkExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tuning knobs of the tunnel lifecycle.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// How long an activation waits for the agent to dial a data connection.
    pub activation_timeout: Duration,
    /// Inactivity after which the reaper closes an active tunnel.
    pub idle_threshold: Duration,
    /// How often the reaper sweeps.
    pub reaper_interval: Duration,
    /// Heartbeat cadence advertised to agents on their control channel.
    pub heartbeat_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(8),
            idle_threshold: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

type ActivationOutcome = Option<Result<u16, TunnelError>>;

struct PendingActivation {
    endpoint_id: EndpointId,
    established_tx: oneshot::Sender<AgentConn>,
}

/// Owner of all tunnel state for the process lifetime.
pub struct TunnelManager {
    registry: Arc<TunnelRegistry>,
    options: TunnelOptions,
    /// Control channel senders, one per connected agent.
    control: RwLock<HashMap<EndpointId, mpsc::Sender<ControlMessage>>>,
    /// Running data channels, one per activating/active tunnel.
    channels: Mutex<HashMap<EndpointId, DataChannelHandle>>,
    /// In-flight activations; concurrent callers attach to the same result.
    activations: Mutex<HashMap<EndpointId, watch::Receiver<ActivationOutcome>>>,
    /// Data channel tokens issued but not yet redeemed.
    pending: Mutex<HashMap<String, PendingActivation>>,
    shutdown: CancellationToken,
}

impl TunnelManager {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            registry: Arc::new(TunnelRegistry::new()),
            options,
            control: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            activations: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Current snapshot of the endpoint's tunnel, never blocking beyond lock
    /// acquisition.
    pub async fn tunnel_details(&self, endpoint_id: EndpointId) -> Tunnel {
        self.registry.details(endpoint_id).await
    }

    /// Refresh the endpoint's idle clock; called by the forwarder around
    /// every transfer.
    pub async fn set_tunnel_active(&self, endpoint_id: EndpointId) {
        self.registry.set_active(endpoint_id).await;
    }

    /// Merge job metadata into the endpoint's pending-job record and push
    /// the updated schedule to the agent if its control channel is up;
    /// poll-only agents pick it up on their next check-in.
    pub async fn add_edge_job(&self, endpoint_id: EndpointId, job: EdgeJob) {
        self.registry.add_job(endpoint_id, job).await;
        let sender = self.control.read().await.get(&endpoint_id).cloned();
        if let Some(sender) = sender {
            let jobs = self.registry.jobs(endpoint_id).await;
            let _ = sender.send(ControlMessage::PendingJobs { jobs }).await;
        }
    }

    /// Jobs pending delivery to the endpoint's agent.
    pub async fn pending_jobs(&self, endpoint_id: EndpointId) -> Vec<EdgeJob> {
        self.registry.jobs(endpoint_id).await
    }

    /// Whether the endpoint's agent currently holds a control channel.
    pub async fn agent_connected(&self, endpoint_id: EndpointId) -> bool {
        self.control.read().await.contains_key(&endpoint_id)
    }

    /// Ensure the endpoint has an active tunnel and return its loopback port.
    ///
    /// Single-flight per endpoint: the first caller spawns an independent
    /// activation attempt, concurrent callers wait on the same outcome. The
    /// attempt task owns every state transition, so a caller that gives up
    /// early cannot corrupt shared state.
    pub async fn activate(self: Arc<Self>, endpoint_id: EndpointId) -> Result<u16, TunnelError> {
        let snapshot = self.registry.details(endpoint_id).await;
        if snapshot.status == TunnelStatus::Active {
            self.registry.set_active(endpoint_id).await;
            return Ok(snapshot.port);
        }

        let mut rx = {
            let mut activations = self.activations.lock().await;
            if let Some(rx) = activations.get(&endpoint_id) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                activations.insert(endpoint_id, rx.clone());
                let manager = Arc::clone(&self);
                tokio::spawn(async move {
                    let outcome = manager.run_activation(endpoint_id).await;
                    manager.activations.lock().await.remove(&endpoint_id);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(TunnelError::Closed {
                    endpoint_id,
                    reason: "activation attempt aborted".to_string(),
                });
            }
        }
    }

    async fn run_activation(&self, endpoint_id: EndpointId) -> Result<u16, TunnelError> {
        let snapshot = self.registry.details(endpoint_id).await;
        if snapshot.status == TunnelStatus::Active {
            return Ok(snapshot.port);
        }

        let control = match self.control.read().await.get(&endpoint_id) {
            Some(sender) => sender.clone(),
            None => return Err(TunnelError::AgentNotConnected(endpoint_id)),
        };

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TunnelError::Bind {
                endpoint_id,
                detail: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| TunnelError::Bind {
                endpoint_id,
                detail: e.to_string(),
            })?
            .port();

        self.registry.begin_activation(endpoint_id, port).await?;

        let token = Uuid::new_v4().to_string();
        let (established_tx, established_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            token.clone(),
            PendingActivation {
                endpoint_id,
                established_tx,
            },
        );

        debug!(endpoint_id = %endpoint_id, "requesting data channel from agent");
        if control
            .send(ControlMessage::OpenDataChannel {
                token: token.clone(),
            })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&token);
            self.registry.reset(endpoint_id).await;
            return Err(TunnelError::AgentNotConnected(endpoint_id));
        }

        match timeout(self.options.activation_timeout, established_rx).await {
            Ok(Ok(conn)) => {
                let handle = DataChannel::spawn(
                    endpoint_id,
                    listener,
                    conn,
                    Arc::clone(&self.registry),
                    self.shutdown.child_token(),
                );
                if let Some(stale) = self.channels.lock().await.insert(endpoint_id, handle) {
                    stale.shutdown();
                }

                if self.registry.complete_activation(endpoint_id).await {
                    info!(endpoint_id = %endpoint_id, "tunnel active");
                    Ok(port)
                } else {
                    // Reaped or disconnected while the channel was attaching.
                    if let Some(handle) = self.channels.lock().await.remove(&endpoint_id) {
                        handle.shutdown();
                    }
                    self.registry.reset(endpoint_id).await;
                    Err(TunnelError::Closed {
                        endpoint_id,
                        reason: "closed during activation".to_string(),
                    })
                }
            }
            _ => {
                self.pending.lock().await.remove(&token);
                self.registry.reset(endpoint_id).await;
                warn!(endpoint_id = %endpoint_id, "agent did not open a data channel in time");
                Err(TunnelError::ActivationTimeout(endpoint_id))
            }
        }
    }

    /// Hand an authenticated data connection to its pending activation.
    ///
    /// Connections presenting an unknown or expired token are told to go
    /// away; the activation they belonged to has already been resolved.
    pub(crate) async fn attach_data_channel(&self, token: &str, conn: AgentConn) {
        let pending = self.pending.lock().await.remove(token);
        match pending {
            Some(p) => {
                if let Err(conn) = p.established_tx.send(conn) {
                    debug!(endpoint_id = %p.endpoint_id, "data channel arrived after activation expired");
                    reject(conn, "activation expired").await;
                } else {
                    debug!(endpoint_id = %p.endpoint_id, "data channel attached");
                }
            }
            None => {
                warn!("data connection presented an unknown token");
                reject(conn, "unknown or expired data channel token").await;
            }
        }
    }

    /// Close the endpoint's tunnel and reset it to idle.
    pub async fn close_tunnel(&self, endpoint_id: EndpointId, reason: &str) {
        let was_open = self.registry.mark_closing(endpoint_id).await;
        if let Some(handle) = self.channels.lock().await.remove(&endpoint_id) {
            handle.shutdown();
        }
        self.registry.reset(endpoint_id).await;
        if was_open {
            info!(endpoint_id = %endpoint_id, reason, "tunnel closed");
        }
    }

    /// One reaper pass: close every active tunnel that has been idle longer
    /// than the configured threshold.
    pub async fn sweep_idle(&self) {
        for endpoint_id in self
            .registry
            .stale_active(self.options.idle_threshold)
            .await
        {
            info!(endpoint_id = %endpoint_id, "reaping idle tunnel");
            self.close_tunnel(endpoint_id, "idle timeout").await;
        }
    }

    /// Start the background reaper. Runs until [`TunnelManager::shutdown`].
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let shutdown = manager.shutdown.clone();
        let interval = manager.options.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.sweep_idle().await,
                }
            }
            debug!("reaper stopped");
        })
    }

    /// Register the control channel of a freshly connected agent. A
    /// reconnect replaces the previous channel.
    pub(crate) async fn register_control_channel(
        &self,
        endpoint_id: EndpointId,
        sender: mpsc::Sender<ControlMessage>,
    ) {
        let replaced = self
            .control
            .write()
            .await
            .insert(endpoint_id, sender)
            .is_some();
        if replaced {
            debug!(endpoint_id = %endpoint_id, "replaced stale control channel");
        }
        // Make sure the endpoint shows up in status views once its agent
        // has checked in.
        self.registry.details(endpoint_id).await;
    }

    /// Tear down state for a dropped control connection. Only removes the
    /// registration if it still belongs to that connection, so a quick
    /// reconnect is not clobbered by the old connection's cleanup.
    pub(crate) async fn on_agent_disconnect(
        &self,
        endpoint_id: EndpointId,
        sender: &mpsc::Sender<ControlMessage>,
    ) {
        {
            let mut control = self.control.write().await;
            match control.get(&endpoint_id) {
                Some(current) if current.same_channel(sender) => {
                    control.remove(&endpoint_id);
                }
                _ => return,
            }
        }
        self.close_tunnel(endpoint_id, "agent disconnected").await;
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the reaper and every data channel. Called once at process exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut channels = self.channels.lock().await;
        for (_, handle) in channels.drain() {
            handle.shutdown();
        }
    }
}

async fn reject(mut conn: AgentConn, reason: &str) {
    if let Ok(payload) = encode_message(&ControlMessage::Disconnect {
        reason: reason.to_string(),
    }) {
        let _ = conn.send(payload).await;
    }
}
