use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{OperationStatus, Position, ScannerController, ScannerSnapshot};
use crate::db::{
    models::{ActiveUser, CaptureRecord, OperationFilter, OperationRecord, UserStats},
    repositories::captures::DEFAULT_CAPTURE_LIMIT,
};
use crate::errors::{AppError, AppResult};
use crate::AppState;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Largest page any history endpoint returns.
const MAX_PAGE: u32 = 1000;

/// Window for `GET /api/v1/users`.
const ACTIVE_WINDOW_HOURS: i64 = 1;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/", get(api_root))
        .route("/api/v1/users", get(list_active_users))
        .route("/api/v1/users/{user_id}/state", get(get_scanner_state))
        .route("/api/v1/users/{user_id}/health", get(health_check))
        .route("/api/v1/users/{user_id}/reset", post(reset_scanner))
        .route("/api/v1/users/{user_id}/operations", get(list_operations))
        .route(
            "/api/v1/users/{user_id}/captured-positions",
            get(list_captured_positions),
        )
        .route("/api/v1/users/{user_id}/stats", get(user_stats))
}

async fn scanner_for(state: &AppState, user_id: &str) -> AppResult<ScannerController> {
    Ok(state.scanners.get_or_create(user_id).await?)
}

fn checked_user_id(user_id: &str) -> AppResult<()> {
    if super::validate_user_id(user_id) {
        Ok(())
    } else {
        Err(AppError::bad_request("Invalid user_id format"))
    }
}

#[derive(Debug, Serialize)]
pub struct ApiBanner {
    pub message: &'static str,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub features: [&'static str; 3],
}

async fn api_root() -> Json<ApiBanner> {
    Json(ApiBanner {
        message: "Scanhead API v1 - Multi-User",
        status: "running",
        timestamp: Utc::now(),
        features: ["multi-user", "websocket", "real-time"],
    })
}

async fn get_scanner_state(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Arc<ScannerSnapshot>>> {
    let scanner = scanner_for(&state, &user_id).await?;
    Ok(Json(scanner.get_state_snapshot().await))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub connected_clients: usize,
    pub current_position: Position,
    pub operation_status: OperationStatus,
    pub user_id: String,
    pub is_processing: bool,
}

async fn health_check(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<HealthResponse>> {
    let scanner = scanner_for(&state, &user_id).await?;
    let snapshot = scanner.get_state_snapshot().await;
    Ok(Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        connected_clients: scanner.client_count().await,
        current_position: snapshot.current_position,
        operation_status: snapshot.operation_status,
        user_id,
        is_processing: snapshot.is_processing,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: &'static str,
    pub message: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

async fn reset_scanner(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<ResetResponse>> {
    let scanner = scanner_for(&state, &user_id).await?;
    scanner.reset_scanner().await?;
    log_info!("Scanner {user_id} reset over HTTP");
    Ok(Json(ResetResponse {
        status: "success",
        message: format!("Scanner reset successfully for user {user_id}"),
        user_id,
        timestamp: Utc::now(),
    }))
}

async fn list_operations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(mut filter): Query<OperationFilter>,
) -> AppResult<Json<Vec<OperationRecord>>> {
    checked_user_id(&user_id)?;
    filter.limit = Some(
        filter
            .limit
            .unwrap_or(OperationFilter::DEFAULT_LIMIT)
            .clamp(1, MAX_PAGE),
    );
    let operations = state.db.list_operations(&user_id, &filter).await?;
    Ok(Json(operations))
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureQuery {
    pub limit: Option<u32>,
    pub session_id: Option<String>,
}

async fn list_captured_positions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<CaptureQuery>,
) -> AppResult<Json<Vec<CaptureRecord>>> {
    checked_user_id(&user_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_CAPTURE_LIMIT).clamp(1, MAX_PAGE);
    let captures = state
        .db
        .list_captures(&user_id, query.session_id.as_deref(), limit)
        .await?;
    Ok(Json(captures))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: UserStats,
    pub timestamp: DateTime<Utc>,
}

async fn user_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<StatsResponse>> {
    checked_user_id(&user_id)?;
    let stats = state.db.user_stats(&user_id).await?;
    Ok(Json(StatsResponse {
        stats,
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ActiveUsersResponse {
    pub active_users: Vec<ActiveUser>,
    pub total_active_users: usize,
    pub timestamp: DateTime<Utc>,
}

async fn list_active_users(State(state): State<AppState>) -> AppResult<Json<ActiveUsersResponse>> {
    let since = Utc::now() - Duration::hours(ACTIVE_WINDOW_HOURS);
    let active_users = state.db.active_users(since).await?;
    Ok(Json(ActiveUsersResponse {
        total_active_users: active_users.len(),
        active_users,
        timestamp: Utc::now(),
    }))
}
