//! Parse API: classify and extract text from an uploaded file.

use axum::Json;
use axum::extract::{Multipart, State};
use axum::response::IntoResponse;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::services::parser_dispatch::ParseError;
use crate::utils::{ApiError, ApiResult};

/// Parse an uploaded résumé file
/// POST /parse (multipart: file, user_id, job_id)
pub async fn parse_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut user_id = String::new();
    let mut job_id = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Unable to read file: {}", e)))?;
                file_bytes = Some(bytes.to_vec());
            },
            "user_id" => user_id = field.text().await.unwrap_or_default(),
            "job_id" => job_id = field.text().await.unwrap_or_default(),
            _ => {},
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| ApiError::bad_request("Missing file field"))?;
    if user_id.is_empty() {
        return Err(ApiError::bad_request("Missing user_id field"));
    }

    tracing::info!(
        "[parse] {} ({} bytes) for user {} job {}",
        filename,
        file_bytes.len(),
        user_id,
        job_id
    );

    let route = state.router.analyze(&file_bytes, &filename);
    if route.rejected {
        return Ok(Json(json!({
            "success": false,
            "text": "",
            "file_type": route.file_type.as_str(),
            "parse_method": null,
            "page_count": route.page_count,
            "is_encrypted": route.encrypted,
            "error_message": route.reject_reason,
            "warnings": route.warnings,
        })));
    }

    match state.parsers.parse(route.file_type, &file_bytes).await {
        Ok(outcome) => Ok(Json(json!({
            "success": true,
            "text": outcome.text,
            "file_type": route.file_type.as_str(),
            "parse_method": outcome.method,
            "page_count": outcome.page_count,
            "is_encrypted": false,
            "warnings": route.warnings,
        }))),
        Err(ParseError::Encrypted) => Ok(Json(json!({
            "success": false,
            "text": "",
            "file_type": route.file_type.as_str(),
            "parse_method": null,
            "page_count": route.page_count,
            "is_encrypted": true,
            "error_message": "document is encrypted",
            "warnings": route.warnings,
        }))),
        Err(e) => Ok(Json(json!({
            "success": false,
            "text": "",
            "file_type": route.file_type.as_str(),
            "parse_method": null,
            "page_count": route.page_count,
            "is_encrypted": false,
            "error_message": e.to_string(),
            "warnings": route.warnings,
        }))),
    }
}
