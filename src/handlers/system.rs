//! Health, feature-flag and debug APIs.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub detailed: bool,
}

/// GET /health?detailed
pub async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    if !query.detailed {
        return Json(json!({"status": "ok"}));
    }

    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let queue_stats = state.queue.queue_stats().await;

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "queue_available": state.queue.is_available(),
        "queue_depths": queue_stats,
        "storage_configured": state.storage.is_configured(),
        "llm_providers": state
            .llm
            .available_providers()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>(),
    }))
}

/// GET /feature-flags
pub async fn feature_flags(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let flags = state.flags.current();
    Json(json!({
        "use_new_pipeline": flags.use_new_pipeline,
        "use_llm_validation": flags.use_llm_validation,
        "use_agent_messaging": flags.use_agent_messaging,
        "use_hallucination_detection": flags.use_hallucination_detection,
        "use_evidence_tracking": flags.use_evidence_tracking,
        "new_pipeline_rollout_percentage": flags.new_pipeline_rollout_percentage,
        "new_pipeline_user_count": flags.new_pipeline_user_ids.len(),
        "debug_pipeline": flags.debug_pipeline,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FlagCheckQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// GET /feature-flags/check?user_id&job_id
pub async fn feature_flags_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FlagCheckQuery>,
) -> impl IntoResponse {
    let flags = state.flags.current();
    let use_new =
        flags.should_use_new_pipeline(query.user_id.as_deref(), query.job_id.as_deref());
    Json(json!({
        "use_new_pipeline": use_new,
        "user_id": query.user_id,
        "job_id": query.job_id,
    }))
}

/// POST /feature-flags/reload
pub async fn feature_flags_reload(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let flags = state.flags.reload_from_env();
    Json(json!({
        "success": true,
        "use_new_pipeline": flags.use_new_pipeline,
        "new_pipeline_rollout_percentage": flags.new_pipeline_rollout_percentage,
    }))
}

/// GET /debug (refused in production)
pub async fn debug(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    if std::env::var("APP_ENV").map(|v| v == "production").unwrap_or(false) {
        return Err(ApiError::not_found("Not found"));
    }

    Ok(Json(json!({
        "config": {
            "analysis_mode": state.config.llm.analysis_mode.as_str(),
            "min_text_length": state.config.analysis.min_text_length,
            "confidence_threshold": state.config.llm.confidence_threshold,
            "use_parallel_llm": state.config.llm.use_parallel_llm,
            "use_split_queues": state.config.queue.use_split_queues,
        },
        "flags": {
            "use_new_pipeline": state.flags.current().use_new_pipeline,
        },
        "queue_depths": state.queue.queue_stats().await,
        "dlq_count": state.queue.dlq_count().await,
    })))
}
