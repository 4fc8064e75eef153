//! Bearer token middleware for the management routes
//!
//! The full user/RBAC stack lives outside this repository; the management
//! surface is guarded by a single static token when one is configured.

use crate::models::ErrorResponse;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

pub struct AuthState {
    pub token: Option<String>,
}

pub async fn require_token(
    State(auth): State<Arc<AuthState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &auth.token else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if provided == Some(expected.as_str()) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "invalid or missing bearer token".to_string(),
            }),
        )
            .into_response()
    }
}
