//! HTTP request handlers.

use super::AppState;
use crate::db::DeviceSelector;
use crate::monitor::{MonitorError, UptimeWindow};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> Response {
    match state.monitor.devices() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Checks
// ============================================================================

pub async fn handle_check_device(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.monitor.check_one(id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_check_many(
    State(state): State<AppState>,
    Json(selector): Json<DeviceSelector>,
) -> Response {
    match state.monitor.check_many(&selector).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    #[serde(default)]
    pub window: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UptimeResponse {
    pub device_id: i64,
    pub window: String,
    pub uptime_pct: Option<f64>,
    pub outage_count: i64,
    pub total_samples: i64,
}

pub async fn handle_get_uptime(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<UptimeQuery>,
) -> Response {
    let window = match query.window.as_deref() {
        Some(w) => match w.parse::<UptimeWindow>() {
            Ok(window) => window,
            Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
        },
        None => UptimeWindow::default(),
    };

    match state.monitor.uptime(id, window) {
        Ok(report) => Json(UptimeResponse {
            device_id: id,
            window: window.to_string(),
            uptime_pct: report.uptime_pct,
            outage_count: report.outage_count,
            total_samples: report.total_samples,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusLogQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn handle_get_status_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<StatusLogQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);

    match state.monitor.status_log(id, limit) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: MonitorError) -> Response {
    let status = match &e {
        MonitorError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        MonitorError::InvalidAddress(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MonitorError::ProbeFacilityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MonitorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}
