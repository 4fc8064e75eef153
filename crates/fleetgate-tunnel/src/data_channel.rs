//! Per-endpoint data channel
//!
//! Splices connections accepted on the endpoint's loopback forwarding port
//! into multiplexed frames on the agent's data connection. Every frame in
//! either direction refreshes the tunnel's idle clock.

use crate::registry::TunnelRegistry;
use crate::AgentConn;
use bytes::Bytes;
use dashmap::DashMap;
use fleetgate_types::{EndpointId, Frame, FrameFlags, FrameType, StreamId};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const FRAME_QUEUE_DEPTH: usize = 256;
const STREAM_QUEUE_DEPTH: usize = 64;

/// Handle used by the manager to tear a data channel down.
pub(crate) struct DataChannelHandle {
    cancel: CancellationToken,
    _task: tokio::task::JoinHandle<()>,
}

impl DataChannelHandle {
    pub(crate) fn shutdown(self) {
        self.cancel.cancel();
    }
}

pub(crate) struct DataChannel;

impl DataChannel {
    /// Spawn the channel task. It runs until cancelled, the agent connection
    /// drops, or the loopback listener fails.
    pub(crate) fn spawn(
        endpoint_id: EndpointId,
        listener: TcpListener,
        conn: AgentConn,
        registry: Arc<TunnelRegistry>,
        cancel: CancellationToken,
    ) -> DataChannelHandle {
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run(endpoint_id, listener, conn, registry, run_cancel).await;
        });
        DataChannelHandle {
            cancel,
            _task: task,
        }
    }
}

async fn run(
    endpoint_id: EndpointId,
    listener: TcpListener,
    conn: AgentConn,
    registry: Arc<TunnelRegistry>,
    cancel: CancellationToken,
) {
    let (mut sink, mut agent_rx) = conn.split();
    let streams: Arc<DashMap<StreamId, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
    let next_stream_id = AtomicU32::new(1);

    // Single writer owns the agent-facing sink.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        let payload = match frame.encode() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("dropping unencodable frame: {}", e);
                                continue;
                            }
                        };
                        if sink.send(payload).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let agent_reader = async {
        while let Some(next) = agent_rx.next().await {
            let buf = match next {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, "data channel read error: {}", e);
                    break;
                }
            };
            let frame = match Frame::decode(buf.freeze()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, "malformed frame from agent: {}", e);
                    break;
                }
            };
            match frame.frame_type {
                FrameType::Data => {
                    registry.touch(endpoint_id).await;
                    let sender = streams
                        .get(&frame.stream_id)
                        .map(|entry| entry.value().clone());
                    if let Some(sender) = sender {
                        if sender.send(frame.payload).await.is_err() {
                            streams.remove(&frame.stream_id);
                        }
                    }
                }
                FrameType::Close => {
                    streams.remove(&frame.stream_id);
                }
                FrameType::Open => {
                    warn!(endpoint_id = %endpoint_id, "unexpected open frame from agent");
                }
            }
        }
    };

    let acceptor = async {
        loop {
            let (local, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, "forwarding listener accept failed: {}", e);
                    break;
                }
            };
            let stream_id = next_stream_id.fetch_add(1, Ordering::Relaxed);
            let (sender, receiver) = mpsc::channel::<Bytes>(STREAM_QUEUE_DEPTH);
            streams.insert(stream_id, sender);
            if frame_tx.send(Frame::open(stream_id)).await.is_err() {
                break;
            }
            tokio::spawn(pump_local_stream(
                endpoint_id,
                stream_id,
                local,
                receiver,
                frame_tx.clone(),
                Arc::clone(&streams),
                Arc::clone(&registry),
                cancel.child_token(),
            ));
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => debug!(endpoint_id = %endpoint_id, "data channel cancelled"),
        _ = agent_reader => debug!(endpoint_id = %endpoint_id, "agent data connection closed"),
        _ = acceptor => {},
    }

    // Take the per-stream pumps down with the channel.
    cancel.cancel();
    writer.abort();
}

/// Move bytes between one accepted loopback connection and the agent, until
/// either side closes or the channel is cancelled.
#[allow(clippy::too_many_arguments)]
async fn pump_local_stream(
    endpoint_id: EndpointId,
    stream_id: StreamId,
    local: TcpStream,
    mut from_agent: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<Frame>,
    streams: Arc<DashMap<StreamId, mpsc::Sender<Bytes>>>,
    registry: Arc<TunnelRegistry>,
    cancel: CancellationToken,
) {
    let (mut read_half, mut write_half) = local.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = frame_tx
                        .send(Frame::close(stream_id).with_flags(FrameFlags::new().with_fin()))
                        .await;
                    break;
                }
                Ok(n) => {
                    registry.touch(endpoint_id).await;
                    if frame_tx
                        .send(Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!(endpoint_id = %endpoint_id, stream_id, "local read failed: {}", e);
                    let _ = frame_tx
                        .send(Frame::close(stream_id).with_flags(FrameFlags::new().with_rst()))
                        .await;
                    break;
                }
            },
            chunk = from_agent.recv() => match chunk {
                Some(data) => {
                    registry.touch(endpoint_id).await;
                    if write_half.write_all(&data).await.is_err() {
                        let _ = frame_tx.send(Frame::close(stream_id)).await;
                        break;
                    }
                }
                None => {
                    // Agent closed its side of the stream.
                    let _ = write_half.shutdown().await;
                    break;
                }
            },
        }
    }

    streams.remove(&stream_id);
}
