//! Management API surface of the fleetgate control plane
//!
//! Thin axum collaborators over the tunnel and proxy core: the generic
//! endpoint proxy, the WebSocket proxy, tunnel status views, the edge agent
//! poll endpoint and the edge job log upload flow.

pub mod datastore;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{middleware as axum_middleware, Json, Router};
use fleetgate_proxy::{ForwardError, RequestForwarder};
use fleetgate_tunnel::TunnelManager;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use datastore::{
    DataStore, FileService, InMemoryDataStore, LocalFileService, StoreError,
};

use crate::models::ErrorResponse;

/// Application state shared across handlers
pub struct AppState {
    pub forwarder: Arc<RequestForwarder>,
    pub manager: Arc<TunnelManager>,
    pub store: Arc<dyn DataStore>,
    pub files: Arc<dyn FileService>,
}

/// Handler errors, mapped onto HTTP statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("endpoint {0} not found")]
    EndpointNotFound(u32),

    #[error("edge job {0} not found")]
    EdgeJobNotFound(u32),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::EndpointNotFound(_) | ApiError::EdgeJobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forward(e) => e.status(),
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleetgate API",
        version = "0.1.0",
        description = "Management control plane for fleets of edge endpoints",
    ),
    paths(
        handlers::health_check,
        handlers::tunnel_status,
        handlers::edge_status,
        handlers::upload_edge_job_logs,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::TunnelStatusView,
            models::EdgeJobView,
            models::EdgeStatusResponse,
            models::LogsPayload,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel status endpoints"),
        (name = "edge", description = "Edge agent poll and job log endpoints"),
        (name = "system", description = "System health endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
    /// Static bearer token guarding the management routes. `None` disables
    /// the check.
    pub api_token: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".parse().expect("valid default address"),
            enable_cors: true,
            api_token: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        forwarder: Arc<RequestForwarder>,
        manager: Arc<TunnelManager>,
        store: Arc<dyn DataStore>,
        files: Arc<dyn FileService>,
    ) -> Self {
        let state = Arc::new(AppState {
            forwarder,
            manager,
            store,
            files,
        });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let auth_state = Arc::new(middleware::AuthState {
            token: self.config.api_token.clone(),
        });

        // Agent-facing and liveness routes; agent authentication is the
        // signature check on the agent side plus the out-of-scope bouncer.
        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route(
                "/api/endpoints/{id}/edge/status",
                get(handlers::edge_status),
            )
            .route(
                "/api/endpoints/{id}/edge/jobs/{job_id}/logs",
                post(handlers::upload_edge_job_logs),
            )
            .with_state(self.state.clone());

        // Management routes behind the bearer token.
        let protected_router = Router::new()
            .route("/api/endpoints/{id}/tunnel", get(handlers::tunnel_status))
            .route(
                "/api/endpoints/{id}/proxy/{*path}",
                any(handlers::proxy_endpoint),
            )
            .route(
                "/api/endpoints/{id}/ws/{*path}",
                get(handlers::proxy_endpoint_websocket),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                auth_state,
                middleware::require_token,
            ));

        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router);

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Start the API server
    pub async fn start(self) -> std::io::Result<()> {
        let router = self.build_router();

        info!("starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        axum::serve(listener, router).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        // Ensure the OpenAPI spec can be generated without panics
        let _api_doc = ApiDoc::openapi();
    }
}
