//! Request forwarding core of the fleetgate control plane
//!
//! [`RequestForwarder`] pushes inbound HTTP and WebSocket requests to edge
//! endpoints through their reverse tunnels, signing every request so agents
//! can authenticate the control plane without a shared PKI.
//! [`ProxyFactory`] serves directly reachable endpoints with cached
//! per-endpoint reverse proxies, applying each endpoint's own TLS policy.

pub mod error;
pub mod factory;
pub mod forwarder;
mod tls;
pub mod websocket;

pub use error::ForwardError;
pub use factory::{EndpointProxy, ProxyFactory};
pub use forwarder::RequestForwarder;
