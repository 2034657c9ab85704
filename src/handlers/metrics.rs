//! Metrics APIs.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default = "default_minutes")]
    pub minutes: i64,
    #[serde(default)]
    pub pipeline_type: Option<String>,
}

fn default_minutes() -> i64 {
    60
}

/// Aggregated pipeline metrics
/// GET /metrics?minutes&pipeline_type
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    Json(state.metrics.summary(query.minutes, query.pipeline_type.as_deref()))
}

/// Success-rate health snapshot over the last hour
/// GET /metrics/health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.metrics.summary(60, None);
    let success_rate = summary["success_rate"].as_f64().unwrap_or(0.0);
    let healthy = summary["completed"].as_u64().unwrap_or(0) == 0 || success_rate >= 0.9;
    Json(json!({
        "healthy": healthy,
        "success_rate": success_rate,
        "window_minutes": 60,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    20
}

/// Most recent pipeline runs
/// GET /metrics/recent
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    Json(state.metrics.recent(query.limit.min(200)))
}

/// Token totals and cost projections by provider/model
/// GET /metrics/llm-cost
pub async fn llm_cost(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.llm_cost_report())
}
