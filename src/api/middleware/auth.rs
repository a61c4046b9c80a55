use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::api::error::ApiResponse;
use crate::api::routes::AppState;

/// Static bearer token check. Missing, malformed and wrong tokens all get 401.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if !token.is_empty() && token == state.api_token => next.run(req).await,
        Some(_) => {
            debug!("Rejected request with invalid bearer token");
            unauthorized("invalid bearer token")
        }
        None => unauthorized("missing or malformed Authorization header"),
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, ApiResponse::failure(message, None)).into_response()
}
