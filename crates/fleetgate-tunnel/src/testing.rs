//! Test support: an in-process agent speaking the real wire protocol.
//!
//! The agent binary itself is out of scope of this repository; integration
//! tests (here and in dependent crates) use this implementation to drive the
//! control plane end to end. It connects a control channel, answers
//! `OpenDataChannel` requests by dialing a data connection, and forwards
//! every tunneled stream to a backend address.

use crate::codec;
use bytes::Bytes;
use dashmap::DashMap;
use fleetgate_types::{decode_message, encode_message, ControlMessage, EndpointId};
use fleetgate_types::{Frame, FrameType, StreamId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Behavior of a [`FakeAgent`].
#[derive(Debug, Clone)]
pub struct FakeAgentConfig {
    pub endpoint_id: EndpointId,
    pub node_name: String,
    /// Local backend every tunneled stream is forwarded to.
    pub backend_addr: SocketAddr,
    /// Ignore `OpenDataChannel` requests, so activations time out.
    pub ignore_open_requests: bool,
}

impl FakeAgentConfig {
    pub fn new(endpoint_id: EndpointId, backend_addr: SocketAddr) -> Self {
        Self {
            endpoint_id,
            node_name: format!("node-{}", endpoint_id),
            backend_addr,
            ignore_open_requests: false,
        }
    }
}

/// In-process agent connected to a [`crate::TunnelServer`].
pub struct FakeAgent {
    open_requests: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeAgent {
    /// Dial the tunnel server and open a control channel.
    pub async fn connect(
        server_addr: SocketAddr,
        config: FakeAgentConfig,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(server_addr).await?;
        let mut framed = Framed::new(stream, codec());
        let hello = encode_message(&ControlMessage::AgentHello {
            endpoint_id: config.endpoint_id,
            node_name: config.node_name.clone(),
            agent_version: "test".to_string(),
        })
        .expect("encode hello");
        framed.send(hello).await?;

        let open_requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&open_requests);
        let task = tokio::spawn(async move {
            control_loop(framed, server_addr, config, counter).await;
        });

        Ok(Self {
            open_requests,
            task,
        })
    }

    /// Number of `OpenDataChannel` requests seen on the control channel.
    pub fn open_request_count(&self) -> usize {
        self.open_requests.load(Ordering::SeqCst)
    }

    /// Drop the control connection without a goodbye, as a crashing agent
    /// would.
    pub fn disconnect(self) {
        self.task.abort();
    }
}

async fn control_loop(
    mut framed: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    server_addr: SocketAddr,
    config: FakeAgentConfig,
    counter: Arc<AtomicUsize>,
) {
    while let Some(next) = framed.next().await {
        let Ok(buf) = next else { break };
        let Ok(message) = decode_message(&buf) else {
            break;
        };
        match message {
            ControlMessage::OpenDataChannel { token } => {
                counter.fetch_add(1, Ordering::SeqCst);
                if config.ignore_open_requests {
                    continue;
                }
                let backend = config.backend_addr;
                tokio::spawn(async move {
                    if let Err(e) = run_data_channel(server_addr, token, backend).await {
                        eprintln!("fake agent data channel failed: {e}");
                    }
                });
            }
            ControlMessage::Heartbeat { timestamp } => {
                let Ok(ack) = encode_message(&ControlMessage::HeartbeatAck { timestamp }) else {
                    break;
                };
                if framed.send(ack).await.is_err() {
                    break;
                }
            }
            ControlMessage::Disconnect { .. } => break,
            _ => {}
        }
    }
}

async fn run_data_channel(
    server_addr: SocketAddr,
    token: String,
    backend: SocketAddr,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(server_addr).await?;
    let mut framed = Framed::new(stream, codec());
    let hello = encode_message(&ControlMessage::DataHello { token }).expect("encode data hello");
    framed.send(hello).await?;

    let (mut sink, mut stream_half) = framed.split();
    let streams: Arc<DashMap<StreamId, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(payload) = frame.encode() else { continue };
            if sink.send(payload).await.is_err() {
                break;
            }
        }
    });

    while let Some(next) = stream_half.next().await {
        let Ok(buf) = next else { break };
        let Ok(frame) = Frame::decode(buf.freeze()) else {
            break;
        };
        match frame.frame_type {
            FrameType::Open => {
                let stream_id = frame.stream_id;
                let (sender, receiver) = mpsc::channel::<Bytes>(64);
                streams.insert(stream_id, sender);
                let frame_tx = frame_tx.clone();
                let streams = Arc::clone(&streams);
                tokio::spawn(async move {
                    if pump_backend(stream_id, backend, receiver, frame_tx.clone())
                        .await
                        .is_err()
                    {
                        let _ = frame_tx.send(Frame::close(stream_id)).await;
                    }
                    streams.remove(&stream_id);
                });
            }
            FrameType::Data => {
                let sender = streams
                    .get(&frame.stream_id)
                    .map(|entry| entry.value().clone());
                if let Some(sender) = sender {
                    let _ = sender.send(frame.payload).await;
                }
            }
            FrameType::Close => {
                streams.remove(&frame.stream_id);
            }
        }
    }

    writer.abort();
    Ok(())
}

async fn pump_backend(
    stream_id: StreamId,
    backend: SocketAddr,
    mut from_server: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<Frame>,
) -> std::io::Result<()> {
    let backend_stream = TcpStream::connect(backend).await?;
    let (mut read_half, mut write_half) = backend_stream.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = frame_tx.send(Frame::close(stream_id)).await;
                    break;
                }
                Ok(n) => {
                    if frame_tx
                        .send(Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => {
                    let _ = frame_tx.send(Frame::close(stream_id)).await;
                    break;
                }
            },
            chunk = from_server.recv() => match chunk {
                Some(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Block until the endpoint's agent has registered its control channel.
///
/// Panics after ~1s; agent registration is asynchronous with respect to
/// [`FakeAgent::connect`] returning.
pub async fn wait_for_agent(manager: &crate::TunnelManager, endpoint_id: EndpointId) {
    for _ in 0..100 {
        if manager.agent_connected(endpoint_id).await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("agent for endpoint {} never connected", endpoint_id);
}

/// Start a TCP echo server on a random loopback port, for round-trip tests.
pub async fn spawn_echo_backend() -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = socket.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });
    Ok(addr)
}
