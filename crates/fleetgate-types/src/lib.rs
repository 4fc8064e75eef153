//! Shared domain types and agent wire protocol for the fleetgate control plane

pub mod edge;
pub mod endpoint;
pub mod messages;
pub mod mux;

pub use edge::{EdgeJob, EdgeJobEndpointMeta, EdgeJobId, EdgeJobLogsStatus};
pub use endpoint::{Endpoint, EndpointId, EndpointType, TlsConfig, TunnelStatus};
pub use messages::{decode_message, encode_message, ControlMessage, WireError};
pub use mux::{Frame, FrameError, FrameFlags, FrameType, StreamId};

/// Maximum payload size of a single data channel frame.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Header carrying the base64 signature over [`SIGNATURE_MESSAGE`].
///
/// The header names below are an integration contract with the agent and
/// must remain stable across releases.
pub const SIGNATURE_HEADER: &str = "x-fleetgate-signature";

/// Header carrying the control plane's base64 public key.
pub const PUBLIC_KEY_HEADER: &str = "x-fleetgate-publickey";

/// Header carrying the target node name, used by agents that front several
/// logical nodes to pick the right local backend.
pub const TARGET_HEADER: &str = "x-fleetgate-target";

/// Fixed message every forwarded request is signed over. Agents verify the
/// signature against the public key they received at enrollment.
pub const SIGNATURE_MESSAGE: &str = "fleetgate-control-plane";
