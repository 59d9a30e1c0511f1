use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::server::AppState;

/// Admin gate for the verification endpoints.
///
/// No `Authorization: Bearer` header is 401; any token that is not the configured
/// admin token is 403. With no admin token configured every request is refused.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Missing bearer token"))?;

    let authorized = match state.admin_token.as_deref() {
        Some(expected) => bool::from(token.as_bytes().ct_eq(expected.as_bytes())),
        None => false,
    };

    if !authorized {
        warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(reject(StatusCode::FORBIDDEN, "Not authorized for audit administration"));
    }

    Ok(next.run(request).await)
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
