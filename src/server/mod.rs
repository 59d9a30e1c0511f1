//! HTTP boundary: health check plus the admin verification endpoints.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::scheduler::Scheduler;
use crate::audit::verify::Verifier;
use crate::error::LedgerError;

#[derive(Clone)]
pub struct AppState {
    pub verifier: Verifier,
    pub scheduler: Scheduler,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, admin_token: Option<String>) -> Self {
        Self {
            verifier: scheduler.verifier().clone(),
            scheduler,
            admin_token: admin_token.map(Arc::from),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/audit/verify", get(handlers::verify_full))
        .route(
            "/admin/audit/verify/incremental/:partition",
            post(handlers::verify_incremental),
        )
        .route("/admin/audit/verify/trigger", post(handlers::trigger_all))
        .route("/admin/audit/runs", get(handlers::recent_runs))
        .route("/admin/audit/scheduler", get(handlers::scheduler_health))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(admin)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

/// Ledger errors as HTTP responses. Infrastructure failures are 500.
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::ImmutabilityViolation(_) | LedgerError::ConcurrencyConflict(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Audit verification request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
