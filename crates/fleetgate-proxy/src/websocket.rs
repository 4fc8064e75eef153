//! WebSocket forwarding
//!
//! The inbound upgrade is passed through after identity header injection;
//! once both sides are established, messages are spliced bidirectionally
//! until either side closes. Closing one side promptly closes the other.

use crate::error::ForwardError;
use crate::forwarder::{sign_headers, RequestForwarder};
use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use fleetgate_types::Endpoint;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl RequestForwarder {
    /// Forward a WebSocket upgrade to the endpoint and take over the
    /// connection for the session's lifetime.
    pub async fn forward_websocket(
        &self,
        endpoint: &Endpoint,
        node_name: &str,
        path_and_query: &str,
        ws: WebSocketUpgrade,
    ) -> Result<Response, ForwardError> {
        let (target, connector) = if endpoint.endpoint_type.is_edge() {
            let port = self.ensure_tunnel(endpoint.id).await?;
            (
                format!("ws://127.0.0.1:{}{}", port, path_and_query),
                None,
            )
        } else {
            let base = websocket_base(&endpoint.url)?;
            let connector = if base.starts_with("wss://") {
                Some(Connector::Rustls(Arc::new(crate::tls::client_config(
                    endpoint,
                )?)))
            } else {
                None
            };
            (format!("{}{}", base, path_and_query), connector)
        };

        let mut request = target
            .as_str()
            .into_client_request()
            .map_err(|_| ForwardError::MalformedUpgrade)?;
        sign_headers(request.headers_mut(), &self.signature, node_name)?;

        // Establish the upstream side before completing the client upgrade,
        // so handshake failures still map onto proper statuses.
        let upstream = match connect_async_tls_with_config(request, None, false, connector).await {
            Ok((upstream, _response)) => upstream,
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status() == http::StatusCode::FORBIDDEN =>
            {
                return Err(ForwardError::AuthenticationRejected(endpoint.id));
            }
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, "websocket upstream handshake failed: {}", e);
                return Err(ForwardError::Upstream {
                    endpoint_id: endpoint.id,
                    phase: "websocket handshake",
                });
            }
        };

        let endpoint_id = endpoint.id;
        if endpoint.endpoint_type.is_edge() {
            self.manager.set_tunnel_active(endpoint_id).await;
        }
        Ok(ws.on_upgrade(move |client| async move {
            if let Err(e) = splice(client, upstream).await {
                debug!(endpoint_id = %endpoint_id, "websocket session ended: {}", e);
            }
        }))
    }
}

/// Move messages in both directions until one side closes; dropping the
/// other half on return closes it.
async fn splice(
    client: WebSocket,
    upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<(), BoxError> {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let forward = match message? {
                ClientMessage::Text(text) => UpstreamMessage::Text(text.to_string()),
                ClientMessage::Binary(data) => UpstreamMessage::Binary(data.to_vec()),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data.to_vec()),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data.to_vec()),
                ClientMessage::Close(_) => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            };
            upstream_tx.send(forward).await?;
        }
        Ok::<(), BoxError>(())
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let forward = match message? {
                UpstreamMessage::Text(text) => ClientMessage::Text(text.into()),
                UpstreamMessage::Binary(data) => ClientMessage::Binary(data.into()),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data.into()),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data.into()),
                UpstreamMessage::Close(_) => {
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
                UpstreamMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        Ok::<(), BoxError>(())
    };

    tokio::select! {
        result = client_to_upstream => result,
        result = upstream_to_client => result,
    }
}

/// Derive the WebSocket base URL of a directly reachable endpoint.
fn websocket_base(url: &str) -> Result<String, ForwardError> {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if let Some(rest) = trimmed.strip_prefix("tcp://") {
        Ok(format!("ws://{}", rest))
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        Ok(trimmed.to_string())
    } else if !trimmed.is_empty() && !trimmed.contains("://") {
        Ok(format!("ws://{}", trimmed))
    } else {
        Err(ForwardError::InvalidTarget(format!(
            "unsupported endpoint url {:?}",
            url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_base_scheme_mapping() {
        assert_eq!(
            websocket_base("https://10.0.0.5:2376").unwrap(),
            "wss://10.0.0.5:2376"
        );
        assert_eq!(
            websocket_base("http://10.0.0.5:2375/").unwrap(),
            "ws://10.0.0.5:2375"
        );
        assert_eq!(
            websocket_base("tcp://10.0.0.5:2375").unwrap(),
            "ws://10.0.0.5:2375"
        );
        assert_eq!(
            websocket_base("10.0.0.5:9001").unwrap(),
            "ws://10.0.0.5:9001"
        );
        assert!(websocket_base("ftp://10.0.0.5").is_err());
    }
}
