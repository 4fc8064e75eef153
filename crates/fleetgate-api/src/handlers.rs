//! HTTP handlers over the tunnel/proxy core

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use axum::Json;
use fleetgate_types::{EdgeJobId, EdgeJobLogsStatus, EndpointId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::models::*;
use crate::{ApiError, AppState};

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    /// Logical node to address when the agent fronts several; defaults to
    /// the endpoint name.
    pub node_name: Option<String>,
}

/// Generic endpoint proxy: forwards the request body and method verbatim to
/// the endpoint's backend, through the tunnel for edge agents.
pub async fn proxy_endpoint(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(u32, String)>,
    Query(params): Query<ProxyParams>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let endpoint = state
        .store
        .endpoint(EndpointId(id))
        .await?
        .ok_or(ApiError::EndpointNotFound(id))?;
    let node_name = params.node_name.unwrap_or_else(|| endpoint.name.clone());
    let path_and_query = rebuild_path(&path, req.uri().query());

    debug!(endpoint_id = %endpoint.id, path = %path_and_query, "proxying endpoint request");
    let response = state
        .forwarder
        .forward(&endpoint, &node_name, &path_and_query, req)
        .await?;
    Ok(response)
}

/// WebSocket proxy for shell sessions and attach/exec streams.
pub async fn proxy_endpoint_websocket(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(u32, String)>,
    Query(params): Query<ProxyParams>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let endpoint = state
        .store
        .endpoint(EndpointId(id))
        .await?
        .ok_or(ApiError::EndpointNotFound(id))?;
    let node_name = params.node_name.unwrap_or_else(|| endpoint.name.clone());
    let path_and_query = rebuild_path(&path, uri.query());

    debug!(endpoint_id = %endpoint.id, path = %path_and_query, "proxying websocket");
    let response = state
        .forwarder
        .forward_websocket(&endpoint, &node_name, &path_and_query, ws)
        .await?;
    Ok(response)
}

/// Read-only tunnel status for endpoint inspection views
#[utoipa::path(
    get,
    path = "/api/endpoints/{id}/tunnel",
    params(
        ("id" = u32, Path, description = "Endpoint identifier")
    ),
    responses(
        (status = 200, description = "Tunnel state for the endpoint", body = TunnelStatusView),
        (status = 404, description = "Endpoint not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<TunnelStatusView>, ApiError> {
    let endpoint = state
        .store
        .endpoint(EndpointId(id))
        .await?
        .ok_or(ApiError::EndpointNotFound(id))?;

    let tunnel = state.manager.tunnel_details(endpoint.id).await;
    Ok(Json(TunnelStatusView {
        status: tunnel.status,
        seconds_since_activity: tunnel.last_activity.elapsed().as_secs(),
        agent_connected: state.manager.agent_connected(endpoint.id).await,
    }))
}

/// Edge agent poll: tunnel state plus the pending job schedule
#[utoipa::path(
    get,
    path = "/api/endpoints/{id}/edge/status",
    params(
        ("id" = u32, Path, description = "Endpoint identifier")
    ),
    responses(
        (status = 200, description = "Pending work for the endpoint", body = EdgeStatusResponse),
        (status = 404, description = "Endpoint not found", body = ErrorResponse)
    ),
    tag = "edge"
)]
pub async fn edge_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<EdgeStatusResponse>, ApiError> {
    let endpoint = state
        .store
        .endpoint(EndpointId(id))
        .await?
        .ok_or(ApiError::EndpointNotFound(id))?;

    let tunnel = state.manager.tunnel_details(endpoint.id).await;
    let schedules = state
        .manager
        .pending_jobs(endpoint.id)
        .await
        .iter()
        .map(|job| {
            let meta = job.meta_for(endpoint.id);
            EdgeJobView {
                id: job.id,
                cron_expression: job.cron_expression.clone(),
                script_path: job.script_path.clone(),
                collect_logs: meta.collect_logs,
                logs_status: meta.logs_status,
            }
        })
        .collect();

    Ok(Json(EdgeStatusResponse {
        status: tunnel.status,
        checkin_interval_secs: state.manager.options().heartbeat_interval.as_secs(),
        schedules,
    }))
}

/// Edge job log upload
///
/// Persists the uploaded log file, marks the job's logs collected for this
/// endpoint, and refreshes the pending-job record so the agent's next poll
/// sees the collected state.
#[utoipa::path(
    post,
    path = "/api/endpoints/{id}/edge/jobs/{job_id}/logs",
    params(
        ("id" = u32, Path, description = "Endpoint identifier"),
        ("job_id" = u32, Path, description = "Edge job identifier")
    ),
    request_body = LogsPayload,
    responses(
        (status = 204, description = "Log file stored"),
        (status = 404, description = "Endpoint or job not found", body = ErrorResponse)
    ),
    tag = "edge"
)]
pub async fn upload_edge_job_logs(
    State(state): State<Arc<AppState>>,
    Path((id, job_id)): Path<(u32, u32)>,
    Json(payload): Json<LogsPayload>,
) -> Result<StatusCode, ApiError> {
    let endpoint = state
        .store
        .endpoint(EndpointId(id))
        .await?
        .ok_or(ApiError::EndpointNotFound(id))?;
    let mut job = state
        .store
        .edge_job(EdgeJobId(job_id))
        .await?
        .ok_or(ApiError::EdgeJobNotFound(job_id))?;

    state
        .files
        .store_edge_job_log(job.id, endpoint.id, payload.file_content.as_bytes())
        .await?;

    let meta = job.endpoints.entry(endpoint.id).or_default();
    meta.collect_logs = false;
    meta.logs_status = EdgeJobLogsStatus::Collected;

    state.store.update_edge_job(job.clone()).await?;
    state.manager.add_edge_job(endpoint.id, job).await;

    Ok(StatusCode::NO_CONTENT)
}

fn rebuild_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("/{}?{}", path, query),
        _ => format!("/{}", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_path() {
        assert_eq!(rebuild_path("containers/json", None), "/containers/json");
        assert_eq!(
            rebuild_path("containers/json", Some("all=1")),
            "/containers/json?all=1"
        );
        assert_eq!(rebuild_path("info", Some("")), "/info");
    }
}
