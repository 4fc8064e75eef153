//! Endpoint records and tunnel status

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of a managed endpoint. Assigned by the persistence layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EndpointId(pub u32);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EndpointId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// How the control plane reaches an endpoint's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum EndpointType {
    /// Agent is directly reachable at the endpoint URL.
    DirectAgent,
    /// Agent dials out; all traffic goes through a reverse tunnel.
    EdgeAgent,
    /// Orchestrator API fronted by a directly reachable agent.
    OrchestratorAgent,
}

impl EndpointType {
    /// Whether requests to this endpoint must go through a reverse tunnel.
    pub fn is_edge(&self) -> bool {
        matches!(self, EndpointType::EdgeAgent)
    }
}

/// Per-endpoint TLS policy for directly reachable endpoints.
///
/// `skip_verify` is scoped to the endpoint it is configured on; it never
/// weakens verification for other endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub skip_verify: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// A managed remote compute node.
///
/// Owned by the persistence layer; the tunnel/proxy core reads it and never
/// mutates anything but transient status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    /// Base URL for directly reachable endpoints (ignored for edge agents).
    pub url: String,
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Connectivity state of an endpoint's reverse tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// No data channel; the agent may still hold a control connection.
    Idle,
    /// A data channel has been requested and a local port is reserved.
    Activating,
    /// The data channel is established and serving traffic.
    Active,
    /// Being torn down by the reaper or an agent disconnect.
    Closing,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Idle => "idle",
            TunnelStatus::Activating => "activating",
            TunnelStatus::Active => "active",
            TunnelStatus::Closing => "closing",
        };
        f.write_str(s)
    }
}
