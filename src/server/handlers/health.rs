// 健康检查

use crate::server::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ApiResponse;

/// 服务存活信息
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthInfo>> {
    Json(ApiResponse::success(HealthInfo {
        status: "UP",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.coordinator.session_count(),
        timestamp: Utc::now(),
    }))
}
