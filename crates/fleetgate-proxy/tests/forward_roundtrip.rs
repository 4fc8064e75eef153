//! End-to-end forwarding tests: control plane, in-process agent, and a real
//! loopback backend.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use fleetgate_proxy::{ForwardError, ProxyFactory, RequestForwarder};
use fleetgate_signature::{verify_signature, SignatureService};
use fleetgate_tunnel::testing::{wait_for_agent, FakeAgent, FakeAgentConfig};
use fleetgate_tunnel::{TunnelManager, TunnelOptions, TunnelServer};
use fleetgate_types::{
    Endpoint, EndpointId, EndpointType, TlsConfig, TunnelStatus, PUBLIC_KEY_HEADER,
    SIGNATURE_HEADER, SIGNATURE_MESSAGE, TARGET_HEADER,
};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Echo backend: body comes back verbatim, identity headers and the seen
/// URI come back as response headers.
async fn echo(req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .unwrap_or_default();

    let mut response = Response::new(Body::from(bytes));
    for name in [SIGNATURE_HEADER, PUBLIC_KEY_HEADER, TARGET_HEADER] {
        if let Some(value) = parts.headers.get(name) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value.clone());
        }
    }
    response.headers_mut().insert(
        HeaderName::from_static("x-echo-uri"),
        HeaderValue::from_str(&parts.uri.to_string()).unwrap(),
    );
    response
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
            if socket.send(message).await.is_err() {
                break;
            }
        }
    })
}

async fn spawn_backend() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/term", get(ws_echo)).fallback(echo);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_control_plane(options: TunnelOptions) -> (Arc<TunnelManager>, SocketAddr) {
    let manager = Arc::new(TunnelManager::new(options));
    let server = TunnelServer::bind(Arc::clone(&manager), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (manager, addr)
}

fn edge_endpoint(id: u32) -> Endpoint {
    Endpoint {
        id: EndpointId(id),
        name: format!("edge-{}", id),
        url: String::new(),
        endpoint_type: EndpointType::EdgeAgent,
        tls: TlsConfig::default(),
    }
}

fn build_forwarder(manager: &Arc<TunnelManager>) -> (Arc<RequestForwarder>, Arc<SignatureService>) {
    let signature = Arc::new(SignatureService::generate());
    let forwarder = Arc::new(RequestForwarder::new(
        Arc::clone(manager),
        Arc::clone(&signature),
        Arc::new(ProxyFactory::new()),
    ));
    (forwarder, signature)
}

#[tokio::test]
async fn test_forward_through_tunnel_round_trip() {
    let backend = spawn_backend().await;
    let (manager, server_addr) = start_control_plane(TunnelOptions::default()).await;
    let endpoint = edge_endpoint(1);

    let _agent = FakeAgent::connect(server_addr, FakeAgentConfig::new(endpoint.id, backend))
        .await
        .unwrap();
    wait_for_agent(&manager, endpoint.id).await;

    let (forwarder, signature) = build_forwarder(&manager);
    let payload = b"inspect-me".to_vec();
    let req = Request::builder()
        .method("POST")
        .uri("/containers/json?all=1")
        .body(Body::from(payload.clone()))
        .unwrap();

    let response = forwarder
        .forward(&endpoint, "node-edge-1", "/containers/json?all=1", req)
        .await
        .expect("forward through tunnel");
    assert_eq!(response.status(), StatusCode::OK);

    // Tunnel went idle -> active on demand.
    let details = manager.tunnel_details(endpoint.id).await;
    assert_eq!(details.status, TunnelStatus::Active);
    assert_ne!(details.port, 0);

    // The agent-side backend saw the injected identity headers, and the
    // signature validates against the advertised public key.
    let signed = response
        .headers()
        .get(SIGNATURE_HEADER)
        .expect("signature header forwarded")
        .to_str()
        .unwrap()
        .to_string();
    let public_key = response
        .headers()
        .get(PUBLIC_KEY_HEADER)
        .expect("public key header forwarded")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(public_key, signature.encoded_public_key());
    verify_signature(&public_key, SIGNATURE_MESSAGE, &signed).expect("signature valid");
    assert_eq!(
        response.headers().get(TARGET_HEADER).unwrap(),
        "node-edge-1"
    );
    assert_eq!(
        response.headers().get("x-echo-uri").unwrap(),
        "/containers/json?all=1"
    );

    // Byte-identical payload round trip.
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(body.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn test_forward_activation_timeout_maps_to_gateway_timeout() {
    let backend = spawn_backend().await;
    let options = TunnelOptions {
        activation_timeout: Duration::from_millis(300),
        ..TunnelOptions::default()
    };
    let (manager, server_addr) = start_control_plane(options).await;
    let endpoint = edge_endpoint(2);

    let mut config = FakeAgentConfig::new(endpoint.id, backend);
    config.ignore_open_requests = true;
    let _agent = FakeAgent::connect(server_addr, config).await.unwrap();
    wait_for_agent(&manager, endpoint.id).await;

    let (forwarder, _signature) = build_forwarder(&manager);
    let req = Request::builder()
        .uri("/info")
        .body(Body::empty())
        .unwrap();

    let err = forwarder
        .forward(&endpoint, "node-edge-2", "/info", req)
        .await
        .expect_err("activation should time out");
    assert!(matches!(err, ForwardError::Connectivity(_)));
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);

    // No stuck activating state: a retry starts from idle.
    assert_eq!(
        manager.tunnel_details(endpoint.id).await.status,
        TunnelStatus::Idle
    );
}

#[tokio::test]
async fn test_forward_without_agent_is_connectivity_error() {
    let (manager, _server_addr) = start_control_plane(TunnelOptions::default()).await;
    let endpoint = edge_endpoint(3);

    let (forwarder, _signature) = build_forwarder(&manager);
    let req = Request::builder()
        .uri("/info")
        .body(Body::empty())
        .unwrap();

    let err = forwarder
        .forward(&endpoint, "node-edge-3", "/info", req)
        .await
        .expect_err("no agent");
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_forward_direct_endpoint_uses_factory() {
    let backend = spawn_backend().await;
    let (manager, _server_addr) = start_control_plane(TunnelOptions::default()).await;

    let endpoint = Endpoint {
        id: EndpointId(4),
        name: "direct-4".to_string(),
        url: format!("http://{}", backend),
        endpoint_type: EndpointType::DirectAgent,
        tls: TlsConfig::default(),
    };

    let (forwarder, signature) = build_forwarder(&manager);
    let req = Request::builder()
        .method("GET")
        .uri("/version")
        .body(Body::empty())
        .unwrap();

    let response = forwarder
        .forward(&endpoint, "direct-4", "/version", req)
        .await
        .expect("direct forward");
    assert_eq!(response.status(), StatusCode::OK);

    let signed = response
        .headers()
        .get(SIGNATURE_HEADER)
        .expect("signature header")
        .to_str()
        .unwrap();
    verify_signature(signature.encoded_public_key(), SIGNATURE_MESSAGE, signed).unwrap();

    // Direct endpoints never touch the tunnel registry.
    assert_eq!(
        manager.tunnel_details(endpoint.id).await.status,
        TunnelStatus::Idle
    );
}

#[derive(Clone)]
struct WsFrontState {
    forwarder: Arc<RequestForwarder>,
    endpoint: Endpoint,
}

async fn ws_front(State(state): State<WsFrontState>, ws: WebSocketUpgrade) -> Response {
    match state
        .forwarder
        .forward_websocket(&state.endpoint, "node-ws", "/term", ws)
        .await
    {
        Ok(response) => response,
        Err(e) => Response::builder()
            .status(e.status())
            .body(Body::from(e.to_string()))
            .unwrap(),
    }
}

#[tokio::test]
async fn test_websocket_forward_streams_bidirectionally() {
    let backend = spawn_backend().await;
    let (manager, server_addr) = start_control_plane(TunnelOptions::default()).await;
    let endpoint = edge_endpoint(5);

    let _agent = FakeAgent::connect(server_addr, FakeAgentConfig::new(endpoint.id, backend))
        .await
        .unwrap();
    wait_for_agent(&manager, endpoint.id).await;

    let (forwarder, _signature) = build_forwarder(&manager);
    let front = Router::new()
        .route("/ws", get(ws_front))
        .with_state(WsFrontState {
            forwarder,
            endpoint: endpoint.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, front).await.unwrap();
    });

    let (mut socket, _response) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws", front_addr))
            .await
            .expect("client handshake through proxy");

    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            "shell: ls".to_string(),
        ))
        .await
        .unwrap();

    let echoed = socket.next().await.expect("echo frame").unwrap();
    match echoed {
        tokio_tungstenite::tungstenite::Message::Text(text) => assert_eq!(text, "shell: ls"),
        other => panic!("unexpected frame: {:?}", other),
    }

    socket
        .send(tokio_tungstenite::tungstenite::Message::Close(None))
        .await
        .unwrap();

    // The session counts as tunnel traffic.
    assert_eq!(
        manager.tunnel_details(endpoint.id).await.status,
        TunnelStatus::Active
    );
}
