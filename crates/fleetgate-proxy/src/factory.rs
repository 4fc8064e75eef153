//! Backend proxy factory
//!
//! Directly reachable endpoints (container engines, orchestrator APIs) get a
//! cached reverse proxy built from their base URL and TLS material. A cache
//! entry is keyed by a configuration fingerprint, so editing the endpoint's
//! URL or TLS settings rebuilds the proxy and anything else reuses it.
//! Cached proxies hold no per-request state and are safe for concurrent use;
//! identity headers are injected per request at forward time.

use crate::error::ForwardError;
use crate::forwarder::sign_headers;
use axum::body::Body;
use dashmap::DashMap;
use fleetgate_signature::SignatureService;
use fleetgate_types::{Endpoint, EndpointId};
use http::header::HOST;
use http::{Request, Response};
use sha2::{Digest, Sha256};
use std::fs;
use tracing::{debug, warn};

/// Builds and caches one [`EndpointProxy`] per endpoint.
#[derive(Default)]
pub struct ProxyFactory {
    proxies: DashMap<EndpointId, CachedProxy>,
}

struct CachedProxy {
    fingerprint: String,
    proxy: EndpointProxy,
}

impl ProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The proxy for `endpoint`, rebuilt if its URL or TLS configuration
    /// changed since it was cached.
    pub fn proxy_for(&self, endpoint: &Endpoint) -> Result<EndpointProxy, ForwardError> {
        let fingerprint = configuration_fingerprint(endpoint);

        if let Some(cached) = self.proxies.get(&endpoint.id) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.proxy.clone());
            }
        }

        debug!(endpoint_id = %endpoint.id, "building backend proxy");
        let proxy = EndpointProxy::build(endpoint)?;
        self.proxies.insert(
            endpoint.id,
            CachedProxy {
                fingerprint,
                proxy: proxy.clone(),
            },
        );
        Ok(proxy)
    }

    /// Drop the cached proxy, e.g. when the endpoint is deleted.
    pub fn invalidate(&self, endpoint_id: EndpointId) {
        self.proxies.remove(&endpoint_id);
    }
}

/// Digest of everything a proxy is built from.
fn configuration_fingerprint(endpoint: &Endpoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.url.as_bytes());
    hasher.update([endpoint.tls.enabled as u8, endpoint.tls.skip_verify as u8]);
    for path in [
        &endpoint.tls.ca_cert_path,
        &endpoint.tls.cert_path,
        &endpoint.tls.key_path,
    ] {
        if let Some(path) = path {
            hasher.update(path.to_string_lossy().as_bytes());
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Reverse proxy for one directly reachable endpoint.
#[derive(Clone)]
pub struct EndpointProxy {
    endpoint_id: EndpointId,
    client: reqwest::Client,
    base: String,
}

impl EndpointProxy {
    fn build(endpoint: &Endpoint) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if endpoint.tls.enabled {
            if endpoint.tls.skip_verify {
                // Scoped to this endpoint's client only.
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(ca_path) = &endpoint.tls.ca_cert_path {
                let pem = fs::read(ca_path).map_err(|_| ForwardError::TlsVerification {
                    endpoint_id: endpoint.id,
                })?;
                let certificate = reqwest::Certificate::from_pem(&pem).map_err(|_| {
                    ForwardError::TlsVerification {
                        endpoint_id: endpoint.id,
                    }
                })?;
                builder = builder.add_root_certificate(certificate);
            }
            if let (Some(cert_path), Some(key_path)) =
                (&endpoint.tls.cert_path, &endpoint.tls.key_path)
            {
                let mut pem = fs::read(cert_path).map_err(|_| ForwardError::TlsVerification {
                    endpoint_id: endpoint.id,
                })?;
                pem.extend(fs::read(key_path).map_err(|_| ForwardError::TlsVerification {
                    endpoint_id: endpoint.id,
                })?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|_| {
                    ForwardError::TlsVerification {
                        endpoint_id: endpoint.id,
                    }
                })?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|_| ForwardError::TlsVerification {
                endpoint_id: endpoint.id,
            })?;

        Ok(Self {
            endpoint_id: endpoint.id,
            client,
            base: normalize_base(endpoint),
        })
    }

    /// Forward one request to the endpoint's base URL, streaming the body in
    /// both directions.
    pub async fn forward(
        &self,
        req: Request<Body>,
        node_name: &str,
        path_and_query: &str,
        signature: &SignatureService,
    ) -> Result<Response<Body>, ForwardError> {
        let url = format!("{}{}", self.base, path_and_query);
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        headers.remove(HOST);
        sign_headers(&mut headers, signature, node_name)?;

        let request = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .build()
            .map_err(|_| ForwardError::InvalidTarget(format!("invalid upstream url {:?}", url)))?;

        let response = self.client.execute(request).await.map_err(|e| {
            warn!(endpoint_id = %self.endpoint_id, "direct proxy request failed: {}", e);
            ForwardError::Upstream {
                endpoint_id: self.endpoint_id,
                phase: "direct",
            }
        })?;

        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in response.headers() {
                headers.append(name, value.clone());
            }
        }
        builder
            .body(Body::from_stream(response.bytes_stream()))
            .map_err(|_| ForwardError::Upstream {
                endpoint_id: self.endpoint_id,
                phase: "direct",
            })
    }
}

/// Base URL with a concrete HTTP scheme. Container engines are commonly
/// configured with `tcp://`; the TLS flag decides what that means.
fn normalize_base(endpoint: &Endpoint) -> String {
    let trimmed = endpoint.url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        if endpoint.tls.enabled {
            format!("https://{}", rest)
        } else {
            format!("http://{}", rest)
        }
    } else if trimmed.contains("://") {
        trimmed.to_string()
    } else if endpoint.tls.enabled {
        format!("https://{}", trimmed)
    } else {
        format!("http://{}", trimmed)
    }
}
