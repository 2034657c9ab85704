//! Full pipeline API: storage download plus synchronous execution.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::config::AnalysisMode;
use crate::services::pipeline::PipelineRequest;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct PipelineApiRequest {
    pub file_url: String,
    pub file_name: String,
    pub user_id: String,
    pub job_id: String,
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub skip_credit_deduction: bool,
}

fn default_mode() -> String {
    "phase_1".to_string()
}

/// Execute the pipeline synchronously to completion
/// POST /pipeline
pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PipelineApiRequest>,
) -> ApiResult<impl IntoResponse> {
    let file_bytes = state
        .storage
        .download(&request.file_url)
        .await
        .map_err(|e| ApiError::bad_request(format!("Unable to download file: {}", e)))?;

    let outcome = state
        .orchestrator
        .run(PipelineRequest {
            file_bytes,
            filename: request.file_name,
            user_id: request.user_id,
            job_id: request.job_id.clone(),
            mode: AnalysisMode::parse_mode(&request.mode),
            candidate_id: request.candidate_id,
            is_retry: request.is_retry,
            skip_credit_deduction: request.skip_credit_deduction,
        })
        .await;

    let message = if outcome.success {
        "pipeline completed".to_string()
    } else {
        outcome
            .user_message
            .clone()
            .unwrap_or_else(|| "pipeline failed".to_string())
    };

    Ok(Json(json!({
        "success": outcome.success,
        "message": message,
        "job_id": request.job_id,
        "candidate_id": outcome.candidate_id,
        "confidence_score": outcome.confidence_score,
        "is_update": outcome.is_update,
        "error_code": outcome.error_code,
        "processing_time_ms": outcome.processing_time_ms,
    })))
}
