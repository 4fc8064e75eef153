//! HTTP request forwarder
//!
//! Resolves (activating if necessary) the endpoint's tunnel, rewrites the
//! request to the loopback forwarding port, injects the signed identity
//! headers and streams the response back. Directly reachable endpoints are
//! handed to the backend proxy factory instead.

use crate::error::ForwardError;
use crate::factory::ProxyFactory;
use axum::body::Body;
use fleetgate_signature::SignatureService;
use fleetgate_tunnel::TunnelManager;
use fleetgate_types::{
    Endpoint, EndpointId, TunnelStatus, PUBLIC_KEY_HEADER, SIGNATURE_HEADER, SIGNATURE_MESSAGE,
    TARGET_HEADER,
};
use http::header::HOST;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forwards management requests to endpoints, through a tunnel or directly.
pub struct RequestForwarder {
    pub(crate) manager: Arc<TunnelManager>,
    pub(crate) signature: Arc<SignatureService>,
    factory: Arc<ProxyFactory>,
    client: Client<HttpConnector, Body>,
}

impl RequestForwarder {
    pub fn new(
        manager: Arc<TunnelManager>,
        signature: Arc<SignatureService>,
        factory: Arc<ProxyFactory>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            manager,
            signature,
            factory,
            client,
        }
    }

    /// Forward one HTTP request to the endpoint, returning the upstream
    /// response with its body streamed through.
    ///
    /// `path_and_query` is the rewritten upstream path (the management API
    /// prefix already stripped by the HTTP layer).
    pub async fn forward(
        &self,
        endpoint: &Endpoint,
        node_name: &str,
        path_and_query: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ForwardError> {
        if endpoint.endpoint_type.is_edge() {
            self.forward_through_tunnel(endpoint, node_name, path_and_query, req)
                .await
        } else {
            let proxy = self.factory.proxy_for(endpoint)?;
            proxy
                .forward(req, node_name, path_and_query, &self.signature)
                .await
        }
    }

    async fn forward_through_tunnel(
        &self,
        endpoint: &Endpoint,
        node_name: &str,
        path_and_query: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ForwardError> {
        let port = self.ensure_tunnel(endpoint.id).await?;

        let uri: Uri = format!("http://127.0.0.1:{}{}", port, path_and_query)
            .parse()
            .map_err(|_| ForwardError::InvalidTarget("unparsable forwarded path".to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.headers.remove(HOST);
        sign_headers(&mut parts.headers, &self.signature, node_name)?;
        let req = Request::from_parts(parts, body);

        debug!(endpoint_id = %endpoint.id, node = %node_name, "forwarding request through tunnel");
        match self.client.request(req).await {
            Ok(response) => {
                self.manager.set_tunnel_active(endpoint.id).await;
                Ok(response.map(Body::new))
            }
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, "tunnel forward failed: {}", e);
                // The data path is suspect; close so a retry re-activates.
                self.manager
                    .close_tunnel(endpoint.id, "upstream connection failed")
                    .await;
                Err(ForwardError::Upstream {
                    endpoint_id: endpoint.id,
                    phase: "forward",
                })
            }
        }
    }

    /// Resolve the endpoint's forwarding port, activating its tunnel when it
    /// is not already active. Bounded by the manager's activation timeout.
    pub(crate) async fn ensure_tunnel(&self, endpoint_id: EndpointId) -> Result<u16, ForwardError> {
        let tunnel = self.manager.tunnel_details(endpoint_id).await;
        if tunnel.status == TunnelStatus::Active {
            self.manager.set_tunnel_active(endpoint_id).await;
            return Ok(tunnel.port);
        }
        Ok(Arc::clone(&self.manager).activate(endpoint_id).await?)
    }
}

/// Attach the control plane's identity to an outbound request: a fresh
/// signature over the fixed message, the public key, and the target node
/// name the agent routes on.
pub(crate) fn sign_headers(
    headers: &mut HeaderMap,
    signature: &SignatureService,
    node_name: &str,
) -> Result<(), ForwardError> {
    let signed = signature.create_signature(SIGNATURE_MESSAGE);
    headers.insert(
        HeaderName::from_static(SIGNATURE_HEADER),
        HeaderValue::from_str(&signed)
            .map_err(|_| ForwardError::InvalidTarget("signature header value".to_string()))?,
    );
    headers.insert(
        HeaderName::from_static(PUBLIC_KEY_HEADER),
        HeaderValue::from_str(signature.encoded_public_key())
            .map_err(|_| ForwardError::InvalidTarget("public key header value".to_string()))?,
    );
    headers.insert(
        HeaderName::from_static(TARGET_HEADER),
        HeaderValue::from_str(node_name).map_err(|_| {
            ForwardError::InvalidTarget(format!("node name {:?} is not header-safe", node_name))
        })?,
    );
    Ok(())
}
