//! Reverse tunnel subsystem of the fleetgate control plane
//!
//! Agents behind NAT dial out to the embedded [`TunnelServer`]; the
//! [`TunnelManager`] owns per-endpoint tunnel state, turns forwarding demand
//! into data channel activations, and reaps tunnels that go idle. Forwarded
//! traffic enters through a loopback port allocated per endpoint and leaves
//! through multiplexed frames on the agent's data connection.

mod data_channel;
pub mod manager;
pub mod registry;
pub mod server;
pub mod testing;

pub use manager::{TunnelManager, TunnelOptions};
pub use registry::{Tunnel, TunnelRegistry};
pub use server::TunnelServer;

use fleetgate_types::EndpointId;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Tunnel lifecycle errors.
///
/// Error messages carry the endpoint identifier and phase for logging, but
/// never the locally bound port.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("endpoint {0} has no agent connected to the control plane")]
    AgentNotConnected(EndpointId),

    #[error("timed out waiting for endpoint {0} to open a data channel")]
    ActivationTimeout(EndpointId),

    #[error("an activation for endpoint {0} is already in flight")]
    AlreadyActivating(EndpointId),

    #[error("tunnel for endpoint {endpoint_id} closed: {reason}")]
    Closed {
        endpoint_id: EndpointId,
        reason: String,
    },

    #[error("unable to bind a forwarding listener for endpoint {endpoint_id}: {detail}")]
    Bind {
        endpoint_id: EndpointId,
        detail: String,
    },
}

/// A framed agent connection (control or data).
pub(crate) type AgentConn = Framed<TcpStream, LengthDelimitedCodec>;

/// Length-delimited codec shared by control and data connections.
pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(fleetgate_types::MAX_FRAME_SIZE as usize + 1024)
        .new_codec()
}
