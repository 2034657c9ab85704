//! Analysis APIs over pre-parsed text.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::config::AnalysisMode;
use crate::services::pipeline::ProcessTextRequest;
use crate::utils::{ApiError, ApiResult};

fn default_mode() -> String {
    "phase_1".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub text: String,
    pub user_id: String,
    pub job_id: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Analyze text without persistence
/// POST /analyze
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let mode = AnalysisMode::parse_mode(&request.mode);
    let outcome = state
        .orchestrator
        .run_text(ProcessTextRequest {
            text: request.text,
            user_id: request.user_id,
            job_id: request.job_id,
            mode,
            generate_embeddings: false,
            mask_pii: false,
            save_to_db: false,
            source_file: None,
            file_type: None,
        })
        .await;

    Ok(Json(json!({
        "success": outcome.success,
        "data": outcome.data,
        "confidence_score": outcome.confidence_score,
        "field_confidence": outcome.field_confidence,
        "warnings": outcome.warnings,
        "processing_time_ms": outcome.processing_time_ms,
        "mode": mode.as_str(),
        "error_code": outcome.error_code,
        "error_message": outcome.user_message,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub text: String,
    pub user_id: String,
    pub job_id: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_true")]
    pub generate_embeddings: bool,
    #[serde(default = "default_true")]
    pub mask_pii: bool,
    #[serde(default = "default_true")]
    pub save_to_db: bool,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
}

/// Full text processing: analysis, privacy, embeddings, persistence
/// POST /process
pub async fn process(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let mode = AnalysisMode::parse_mode(&request.mode);
    let outcome = state
        .orchestrator
        .run_text(ProcessTextRequest {
            text: request.text,
            user_id: request.user_id,
            job_id: Some(request.job_id),
            mode,
            generate_embeddings: request.generate_embeddings,
            mask_pii: request.mask_pii,
            save_to_db: request.save_to_db,
            source_file: request.source_file,
            file_type: request.file_type,
        })
        .await;

    Ok(Json(json!({
        "success": outcome.success,
        "candidate_id": outcome.candidate_id,
        "data": outcome.data,
        "confidence_score": outcome.confidence_score,
        "pii_count": outcome.pii_count,
        "pii_types": outcome.pii_types,
        "chunk_count": outcome.chunk_count,
        "chunks_saved": outcome.chunks_saved,
        "embedding_tokens": outcome.embedding_tokens,
        "processing_time_ms": outcome.processing_time_ms,
        "warnings": outcome.warnings,
        "is_update": outcome.is_update,
        "error_code": outcome.error_code,
        "error_message": outcome.user_message,
    })))
}
