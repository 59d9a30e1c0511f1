use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::audit::scheduler::{SchedulerHealth, TriggerAck};
use crate::audit::verify::{VerificationKind, VerificationReport, VerificationResult, VerificationRun};
use crate::error::LedgerError;
use crate::server::{ApiError, AppState};

const DEFAULT_RUN_LIMIT: i64 = 50;
const MAX_RUN_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub partition: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": Utc::now()
    }))
}

/// A broken chain is a normal 200 response with `intact: false`.
pub async fn verify_full(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<VerificationReport>, ApiError> {
    let partition = query.partition.as_deref().filter(|p| !p.trim().is_empty());
    info!(partition = partition.unwrap_or("*"), "Admin requested full verification");

    let result = match state.verifier.verify_full(partition).await {
        Ok(result) => result,
        Err(e) => {
            record_failure(&state, VerificationKind::Full, partition, &e).await;
            return Err(e.into());
        }
    };
    state
        .verifier
        .record_run(VerificationKind::Full, partition, &result)
        .await?;
    Ok(Json(VerificationReport::from(&result)))
}

pub async fn verify_incremental(
    State(state): State<AppState>,
    Path(partition): Path<String>,
) -> Result<Json<VerificationReport>, ApiError> {
    let result = match state.verifier.verify_incremental(&partition).await {
        Ok(result) => result,
        Err(e) => {
            record_failure(&state, VerificationKind::Incremental, Some(&partition), &e).await;
            return Err(e.into());
        }
    };
    if !result.skipped {
        state
            .verifier
            .record_run(VerificationKind::Incremental, Some(&partition), &result)
            .await?;
    }
    Ok(Json(VerificationReport::from(&result)))
}

/// The check could not run; the attempt is still logged before the 500 goes out.
async fn record_failure(
    state: &AppState,
    kind: VerificationKind,
    partition: Option<&str>,
    err: &LedgerError,
) {
    let result = VerificationResult::errored(err.to_string());
    if let Err(e) = state.verifier.record_run(kind, partition, &result).await {
        error!("Failed to record verification run: {}", e);
    }
}

pub async fn trigger_all(State(state): State<AppState>) -> Json<TriggerAck> {
    Json(state.scheduler.trigger_all_partitions())
}

pub async fn recent_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<VerificationRun>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    Ok(Json(state.verifier.recent_runs(limit).await?))
}

pub async fn scheduler_health(State(state): State<AppState>) -> Json<SchedulerHealth> {
    Json(state.scheduler.health(Utc::now()).await)
}
