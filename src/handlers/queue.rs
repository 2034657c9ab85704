//! Queue and dead-letter-queue APIs.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::services::queue_service::{JobType, PipelineJob, route_by_extension};
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub candidate_id: Option<String>,
}

/// Enqueue a pipeline job, routed by file type
/// POST /queue/enqueue
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    if !state.queue.is_available() {
        return Err(ApiError::service_unavailable("Queue backend is not configured"));
    }

    // Admission control: HWP uploads are rejected while the slow queue is
    // backed up (the pipeline itself never throttles)
    let job_type = route_by_extension(&request.file_name);
    if job_type == JobType::SlowPipeline
        && state.queue.should_throttle(state.config.queue.backpressure_threshold).await
    {
        return Err(ApiError::too_many_requests(
            "Slow queue is over the back-pressure threshold; retry later",
        )
        .with_code("BACKPRESSURE"));
    }

    let queued = state
        .queue
        .enqueue_pipeline(PipelineJob {
            job_id: request.job_id,
            user_id: request.user_id,
            file_path: request.file_path,
            file_name: request.file_name,
            mode: if request.mode.is_empty() { "phase_1".to_string() } else { request.mode },
            candidate_id: request.candidate_id,
            is_retry: false,
            skip_credit_deduction: false,
            retry_count: 0,
            job_type: None,
        })
        .await
        .map_err(|e| ApiError::internal(format!("Enqueue failed: {}", e)))?;

    Ok(Json(json!({
        "success": true,
        "job_id": queued.job_id,
        "rq_job_id": queued.queue_job_id,
        "status": queued.status,
        "queue": queued.job_type.as_str(),
    })))
}

/// Queue availability and depths
/// GET /queue/status
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.queue.queue_stats().await;
    let should_throttle =
        state.queue.should_throttle(state.config.queue.backpressure_threshold).await;
    Json(json!({
        "available": state.queue.is_available(),
        "fast_queue_size": stats.get("fast").copied().unwrap_or(0),
        "slow_queue_size": stats.get("slow").copied().unwrap_or(0),
        "should_throttle": should_throttle,
    }))
}

// ============================================================================
// DLQ
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DlqListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// GET /dlq/stats
pub async fn dlq_stats(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let stats = state
        .queue
        .dlq_stats()
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(Json(json!({
        "available": state.queue.is_available(),
        "total": stats.total,
        "by_job_type": stats.by_job_type,
        "by_error_type": stats.by_error_type,
        "by_user": stats.by_user,
    })))
}

/// GET /dlq/entries
pub async fn dlq_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqListQuery>,
) -> ApiResult<impl IntoResponse> {
    let entries = state
        .queue
        .dlq_entries(
            query.limit.min(500),
            query.offset,
            query.job_type.as_deref(),
            query.user_id.as_deref(),
        )
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    let count = entries.len();
    Ok(Json(json!({"entries": entries, "count": count})))
}

/// GET /dlq/entry/:id (includes the stored traceback)
pub async fn dlq_entry(
    State(state): State<Arc<AppState>>,
    Path(dlq_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let entry = state
        .queue
        .dlq_entry(&dlq_id)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("DLQ entry {} not found", dlq_id)))?;
    Ok(Json(entry))
}

/// POST /dlq/retry/:id
pub async fn dlq_retry(
    State(state): State<Arc<AppState>>,
    Path(dlq_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let queued = state
        .queue
        .retry_from_dlq(&dlq_id)
        .await
        .map_err(|e| match e {
            crate::services::queue_service::QueueError::EntryNotFound(id) => {
                ApiError::not_found(format!("DLQ entry {} not found", id))
            },
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(json!({
        "success": true,
        "job_id": queued.job_id,
        "rq_job_id": queued.queue_job_id,
        "queue": queued.job_type.as_str(),
    })))
}

/// DELETE /dlq/entry/:id
pub async fn dlq_delete(
    State(state): State<Arc<AppState>>,
    Path(dlq_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state
        .queue
        .remove_from_dlq(&dlq_id)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    if !removed {
        return Err(ApiError::not_found(format!("DLQ entry {} not found", dlq_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DlqClearQuery {
    #[serde(default)]
    pub older_than_days: Option<i64>,
}

/// DELETE /dlq/clear
pub async fn dlq_clear(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqClearQuery>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state
        .queue
        .clear_dlq(query.older_than_days)
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}
