use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::firewall::limiter::{Limiter, LimiterConfig};
use crate::firewall::scorer::Scorer;
use crate::storage::sqlite::{AccessLogQuery, AccessLogStore};
use crate::storage::{StateStore, StoreError};

/// Shared handles for every admin handler.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<Limiter>,
    pub scorer: Arc<Scorer>,
    pub store: Arc<dyn StateStore>,
    pub access_log: Arc<AccessLogStore>,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub fingerprint: String,
    pub reason: Option<String>,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    pub fingerprint: String,
    pub duration_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    pub fingerprint: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct BanStatusResponse {
    pub fingerprint: String,
    pub banned: bool,
    pub remaining_secs: u64,
}

fn store_error(e: StoreError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn get_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

pub async fn get_ban_status(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.limiter.ban_status(&fingerprint).await {
        Ok(remaining) => Json(BanStatusResponse {
            fingerprint,
            banned: remaining.is_some(),
            remaining_secs: remaining.map(|d| d.as_secs()).unwrap_or(0),
        })
        .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn create_ban(
    State(state): State<AppState>,
    Json(req): Json<BanRequest>,
) -> impl IntoResponse {
    let duration = Duration::from_secs(
        req.duration_secs
            .unwrap_or_else(|| state.limiter.config().ban_duration_secs),
    );
    let reason = req.reason.as_deref().unwrap_or("manual ban");

    match state
        .limiter
        .manual_ban(&req.fingerprint, reason, duration)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({
                "fingerprint": req.fingerprint,
                "banned": true,
                "duration_secs": duration.as_secs(),
            })),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn delete_ban(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.limiter.unban(&fingerprint).await {
        Ok(()) => Json(json!({ "fingerprint": fingerprint, "banned": false })).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn create_whitelist(
    State(state): State<AppState>,
    Json(req): Json<WhitelistRequest>,
) -> impl IntoResponse {
    match state
        .limiter
        .add_to_whitelist(&req.fingerprint, Duration::from_secs(req.duration_secs))
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "fingerprint": req.fingerprint, "whitelisted": true })),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn delete_whitelist(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.limiter.remove_from_whitelist(&fingerprint).await {
        Ok(()) => {
            Json(json!({ "fingerprint": fingerprint, "whitelisted": false })).into_response()
        }
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn get_score(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.store.get_user_score(&fingerprint).await {
        Ok(Some(score)) => Json(json!({
            "fingerprint": fingerprint,
            "score": score.score,
            "last_seen": score.last_seen,
            "request_count": score.request_count,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "fingerprint not seen" })),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn reset_score(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.scorer.reset(&fingerprint).await {
        Ok(()) => Json(json!({
            "fingerprint": fingerprint,
            "score": state.scorer.config().initial_score,
        }))
        .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

pub async fn get_limiter_config(State(state): State<AppState>) -> Json<LimiterConfig> {
    Json(state.limiter.config())
}

/// Hot-swap the limiter config; rejected with a structured reason when
/// invalid.
pub async fn update_limiter_config(
    State(state): State<AppState>,
    Json(config): Json<LimiterConfig>,
) -> impl IntoResponse {
    match state.limiter.update_config(config) {
        Ok(()) => Json(state.limiter.config()).into_response(),
        Err(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "invalid limiter config", "reason": reason })),
        )
            .into_response(),
    }
}

pub async fn get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> impl IntoResponse {
    let query = AccessLogQuery {
        fingerprint: params.fingerprint,
        since: params.since,
        until: params.until,
        limit: params.limit.unwrap_or(100),
        offset: params.offset.unwrap_or(0),
    };

    match state.access_log.query(&query) {
        Ok(records) => Json(json!({ "count": records.len(), "records": records })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
