//! Forwarding error taxonomy
//!
//! Messages carry the endpoint identifier and the phase that failed for
//! logging, and never the locally bound tunnel port.

use fleetgate_tunnel::TunnelError;
use fleetgate_types::EndpointId;
use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the request forwarder and backend proxies.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The endpoint could not be reached or activated in time. Recoverable:
    /// the tunnel has been reset so a retry re-activates.
    #[error("unable to reach endpoint: {0}")]
    Connectivity(#[from] TunnelError),

    /// The upstream connection failed after activation.
    #[error("endpoint {endpoint_id}: upstream connection failed during {phase}")]
    Upstream {
        endpoint_id: EndpointId,
        phase: &'static str,
    },

    /// The inbound request asked for a protocol upgrade we cannot satisfy.
    #[error("malformed upgrade request")]
    MalformedUpgrade,

    /// The agent refused the control plane's signature. Not retried: a key
    /// mismatch needs operator action.
    #[error("endpoint {0} rejected the control plane signature")]
    AuthenticationRejected(EndpointId),

    /// The endpoint's TLS material could not be loaded or verified. Never
    /// silently downgraded.
    #[error("endpoint {endpoint_id}: TLS configuration rejected")]
    TlsVerification { endpoint_id: EndpointId },

    /// The request could not be rewritten into a valid upstream target.
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),
}

impl ForwardError {
    /// HTTP status reported to the original client.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Connectivity(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::MalformedUpgrade | ForwardError::InvalidTarget(_) => {
                StatusCode::BAD_REQUEST
            }
            ForwardError::AuthenticationRejected(_) => StatusCode::FORBIDDEN,
            ForwardError::TlsVerification { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}
