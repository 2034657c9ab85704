//! Pipeline orchestrator: sequences the stages over one owned context.
//!
//! Stage order: parsing, pii_extraction, identity_check, analysis,
//! validation, privacy, embedding, save. Fatal stages terminate the run
//! with a classified error; validation, privacy and embedding failures
//! degrade to warnings. Credit is checked up front and debited exactly
//! once, after the first successful non-duplicate save.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use super::context::PipelineContext;
use super::warnings::{WarningCode, WarningSeverity};
use crate::config::AnalysisMode;
use crate::models::CandidateStatus;
use crate::services::analyst_service::AnalystService;
use crate::services::database_service::{
    CompensationLog, DatabaseService, DbError, DedupKeys,
};
use crate::services::embedding_service::EmbeddingService;
use crate::services::errors::ErrorCode;
use crate::services::feature_flags::FeatureFlagStore;
use crate::services::metrics_service::MetricsService;
use crate::services::parser_dispatch::{ParseError, ParserDispatch};
use crate::services::pii_service;
use crate::services::privacy_service::PrivacyService;
use crate::services::router_service::RouterService;
use crate::services::validator_service::ValidatorService;
use crate::services::webhook_service::{WebhookService, WebhookStatus};

pub struct PipelineRequest {
    pub file_bytes: Vec<u8>,
    pub filename: String,
    pub user_id: String,
    pub job_id: String,
    pub mode: AnalysisMode,
    pub candidate_id: Option<String>,
    pub is_retry: bool,
    pub skip_credit_deduction: bool,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct OrchestratorOutcome {
    pub success: bool,
    pub rejected: bool,
    pub candidate_id: Option<String>,
    /// Final (masked) candidate payload
    pub data: Option<Value>,
    /// 0.0..=1.0
    pub confidence_score: f64,
    pub field_confidence: HashMap<String, f64>,
    pub chunk_count: usize,
    pub chunks_saved: usize,
    pub pii_count: usize,
    pub pii_types: Vec<String>,
    pub embedding_tokens: u64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub user_message: Option<String>,
    pub processing_time_ms: i64,
    pub pipeline_id: String,
    pub is_update: bool,
    pub parent_id: Option<String>,
    pub context_summary: Option<Value>,
}

impl OrchestratorOutcome {
    /// Errors that the queue should retry.
    pub fn is_retryable(&self) -> bool {
        self.error_code
            .as_deref()
            .map(|code| ErrorCode::parse_code(code).is_retryable())
            .unwrap_or(false)
    }
}

pub struct PipelineOrchestrator {
    router: RouterService,
    parsers: ParserDispatch,
    analyst: Arc<AnalystService>,
    validator: Arc<ValidatorService>,
    privacy: Arc<PrivacyService>,
    embedder: Arc<EmbeddingService>,
    database: Arc<DatabaseService>,
    webhooks: Arc<WebhookService>,
    metrics: Arc<MetricsService>,
    flags: Arc<FeatureFlagStore>,
    min_text_length: usize,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analyst: Arc<AnalystService>,
        validator: Arc<ValidatorService>,
        privacy: Arc<PrivacyService>,
        embedder: Arc<EmbeddingService>,
        database: Arc<DatabaseService>,
        webhooks: Arc<WebhookService>,
        metrics: Arc<MetricsService>,
        flags: Arc<FeatureFlagStore>,
        min_text_length: usize,
    ) -> Self {
        Self {
            router: RouterService::new(),
            parsers: ParserDispatch::new(),
            analyst,
            validator,
            privacy,
            embedder,
            database,
            webhooks,
            metrics,
            flags,
            min_text_length,
        }
    }

    pub async fn run(&self, request: PipelineRequest) -> OrchestratorOutcome {
        let start = Utc::now();
        let mut ctx = PipelineContext::new();
        ctx.metadata.candidate_id = request.candidate_id.clone();
        ctx.metadata.job_id = Some(request.job_id.clone());
        ctx.metadata.user_id = Some(request.user_id.clone());
        ctx.metadata.mode = request.mode.as_str().to_string();

        let pipeline_id = ctx.metadata.pipeline_id.clone();
        tracing::info!("[orchestrator] starting pipeline {}", pipeline_id);
        self.metrics.start_pipeline(&pipeline_id, "new", request.is_retry);

        // Credit check runs before any work
        if !request.skip_credit_deduction {
            match self.database.check_credit_available(&request.user_id).await {
                Ok(true) => {},
                Ok(false) => {
                    return self
                        .reject(&mut ctx, &request, ErrorCode::InsufficientCredits, "no credits remaining", start)
                        .await;
                },
                Err(e) => {
                    return self
                        .fail(&mut ctx, &request, ErrorCode::StorageError, &e.to_string(), start)
                        .await;
                },
            }
        }

        self.database
            .create_processing_job(&request.job_id, &request.user_id)
            .await
            .ok();
        self.webhooks
            .notify(&request.job_id, WebhookStatus::Processing, None, None)
            .await;

        if let Err(e) =
            ctx.set_raw_input(request.file_bytes.clone(), &request.filename, "upload")
        {
            return self.fail(&mut ctx, &request, ErrorCode::InvalidFile, &e.to_string(), start).await;
        }

        // Stage: parsing
        match self.stage_parsing(&mut ctx).await {
            Ok(()) => {},
            Err((code, message)) => return self.fail(&mut ctx, &request, code, &message, start).await,
        }

        // Stage: pii_extraction
        self.stage_pii_extraction(&mut ctx).await;
        self.emit_parsed(&mut ctx, &request).await;

        // Stage: identity_check
        if let Some((code, message)) = self.stage_identity_check(&mut ctx).await {
            return self.reject(&mut ctx, &request, code, &message, start).await;
        }

        // Stage: analysis
        match self.stage_analysis(&mut ctx, request.mode).await {
            Ok(()) => {},
            Err((code, message)) => return self.fail(&mut ctx, &request, code, &message, start).await,
        }
        self.emit_analyzed(&request).await;

        // Stage: validation (failures degrade to warnings)
        self.stage_validation(&mut ctx).await;

        // Stage: privacy
        let privacy_output = self.stage_privacy(&mut ctx).await;

        // Stage: embedding (partial success tolerated)
        let embedding_output = self.stage_embedding(&mut ctx).await;

        // Stage: save
        let save_output = match self
            .stage_save(&mut ctx, &request, &privacy_output, &embedding_output)
            .await
        {
            Ok(output) => output,
            Err((code, message)) => {
                if code == ErrorCode::RaceCondition || code == ErrorCode::MissingRequiredFields {
                    return self.reject(&mut ctx, &request, code, &message, start).await;
                }
                return self.fail(&mut ctx, &request, code, &message, start).await;
            },
        };

        // Finalize and report
        let mut final_result = ctx.finalize();
        privacy_output.apply_masks(&mut final_result.candidate);
        let processing_time_ms = (Utc::now() - start).num_milliseconds();
        self.metrics.complete_pipeline(&pipeline_id, true, None);

        let warnings: Vec<String> =
            final_result.warnings.iter().map(|w| w.message.clone()).collect();
        let field_confidence: HashMap<String, f64> = ctx
            .current_data
            .confidence_scores
            .iter()
            .map(|(field, pct)| (field.clone(), *pct as f64 / 100.0))
            .collect();

        let outcome = OrchestratorOutcome {
            success: true,
            rejected: false,
            candidate_id: Some(save_output.candidate_id.clone()),
            data: Some(final_result.candidate.clone()),
            confidence_score: final_result.confidence as f64 / 100.0,
            field_confidence,
            chunk_count: embedding_output.chunk_count,
            chunks_saved: save_output.chunks_saved,
            pii_count: privacy_output.pii_count,
            pii_types: privacy_output.pii_types.clone(),
            embedding_tokens: embedding_output.tokens,
            warnings,
            error: None,
            error_code: None,
            user_message: None,
            processing_time_ms,
            pipeline_id: pipeline_id.clone(),
            is_update: save_output.is_update,
            parent_id: save_output.parent_id.clone(),
            context_summary: self
                .flags
                .current()
                .debug_pipeline
                .then(|| ctx.status_summary()),
        };

        self.database
            .update_job_status(
                &request.job_id,
                "completed",
                Some(&save_output.candidate_id),
                None,
                None,
            )
            .await
            .ok();
        self.webhooks
            .notify(
                &request.job_id,
                WebhookStatus::Completed,
                Some(json!({
                    "candidate_id": save_output.candidate_id,
                    "confidence_score": outcome.confidence_score,
                    "chunk_count": outcome.chunk_count,
                    "is_update": outcome.is_update,
                })),
                None,
            )
            .await;

        tracing::info!(
            "[orchestrator] pipeline {} completed: candidate={}, {}ms",
            pipeline_id,
            save_output.candidate_id,
            processing_time_ms
        );
        outcome
    }

    /// Text-entry variant for pre-parsed input: skips routing/parsing and
    /// runs the remaining stages. Embedding, privacy and save are
    /// individually optional.
    pub async fn run_text(&self, request: ProcessTextRequest) -> OrchestratorOutcome {
        let start = Utc::now();
        let mut ctx = PipelineContext::new();
        ctx.metadata.job_id = request.job_id.clone();
        ctx.metadata.user_id = Some(request.user_id.clone());
        ctx.metadata.mode = request.mode.as_str().to_string();
        let pipeline_id = ctx.metadata.pipeline_id.clone();
        self.metrics.start_pipeline(&pipeline_id, "text", false);

        ctx.set_parsed_text(request.text.clone(), None);
        ctx.parsed_data.parsing_method = "pre_parsed".to_string();
        ctx.raw_input.filename = request.source_file.clone().unwrap_or_default();
        ctx.raw_input.file_extension = request.file_type.clone().unwrap_or_default();

        let placeholder = PipelineRequest {
            file_bytes: Vec::new(),
            filename: request.source_file.clone().unwrap_or_default(),
            user_id: request.user_id.clone(),
            job_id: request.job_id.clone().unwrap_or_default(),
            mode: request.mode,
            candidate_id: None,
            is_retry: false,
            skip_credit_deduction: true,
        };

        if ctx.parsed_data.raw_text.trim().chars().count() < self.min_text_length {
            return self
                .fail(&mut ctx, &placeholder, ErrorCode::TextTooShort, "input text too short", start)
                .await;
        }

        self.stage_pii_extraction(&mut ctx).await;
        if let Some((code, message)) = self.stage_identity_check(&mut ctx).await {
            return self.reject(&mut ctx, &placeholder, code, &message, start).await;
        }

        if let Err((code, message)) = self.stage_analysis(&mut ctx, request.mode).await {
            return self.fail(&mut ctx, &placeholder, code, &message, start).await;
        }
        self.stage_validation(&mut ctx).await;

        let privacy_output = if request.mask_pii {
            self.stage_privacy(&mut ctx).await
        } else {
            ctx.stage_results.skip_stage("privacy", "privacy_agent");
            PrivacyStageOutput::empty()
        };

        let embedding_output = if request.generate_embeddings {
            self.stage_embedding(&mut ctx).await
        } else {
            ctx.stage_results.skip_stage("embedding", "embedding_service");
            EmbeddingStageOutput { chunk_count: 0, tokens: 0, chunks: Vec::new() }
        };

        let save_output = if request.save_to_db {
            match self
                .stage_save(&mut ctx, &placeholder, &privacy_output, &embedding_output)
                .await
            {
                Ok(output) => Some(output),
                Err((code, message)) => {
                    return self.fail(&mut ctx, &placeholder, code, &message, start).await;
                },
            }
        } else {
            ctx.stage_results.skip_stage("save", "database");
            None
        };

        let mut final_result = ctx.finalize();
        privacy_output.apply_masks(&mut final_result.candidate);
        self.metrics.complete_pipeline(&pipeline_id, true, None);

        OrchestratorOutcome {
            success: true,
            rejected: false,
            candidate_id: save_output.as_ref().map(|s| s.candidate_id.clone()),
            data: Some(final_result.candidate.clone()),
            confidence_score: final_result.confidence as f64 / 100.0,
            field_confidence: ctx
                .current_data
                .confidence_scores
                .iter()
                .map(|(field, pct)| (field.clone(), *pct as f64 / 100.0))
                .collect(),
            chunk_count: embedding_output.chunk_count,
            chunks_saved: save_output.as_ref().map(|s| s.chunks_saved).unwrap_or(0),
            pii_count: privacy_output.pii_count,
            pii_types: privacy_output.pii_types,
            embedding_tokens: embedding_output.tokens,
            warnings: final_result.warnings.iter().map(|w| w.message.clone()).collect(),
            error: None,
            error_code: None,
            user_message: None,
            processing_time_ms: (Utc::now() - start).num_milliseconds(),
            pipeline_id,
            is_update: save_output.as_ref().map(|s| s.is_update).unwrap_or(false),
            parent_id: save_output.and_then(|s| s.parent_id),
            context_summary: self
                .flags
                .current()
                .debug_pipeline
                .then(|| ctx.status_summary()),
        }
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn stage_parsing(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<(), (ErrorCode, String)> {
        ctx.start_stage("parsing", "router");

        let file_bytes = ctx.raw_input.file_bytes.clone().unwrap_or_default();
        let filename = ctx.raw_input.filename.clone();

        let route = self.router.analyze(&file_bytes, &filename);
        if route.rejected {
            let reason = route.reject_reason.clone().unwrap_or_default();
            let code = if route.encrypted {
                ErrorCode::Encrypted
            } else {
                ErrorCode::parse_code(reason.split(':').next().unwrap_or(""))
            };
            ctx.fail_stage("parsing", &reason, Some(code.as_str()));
            return Err((code, reason));
        }
        for warning in &route.warnings {
            ctx.warnings.add_parsing_issue(warning);
        }

        let parsed = match self.parsers.parse(route.file_type, &file_bytes).await {
            Ok(outcome) => outcome,
            Err(ParseError::Encrypted) => {
                let message = "document is encrypted".to_string();
                ctx.fail_stage("parsing", &message, Some(ErrorCode::Encrypted.as_str()));
                return Err((ErrorCode::Encrypted, message));
            },
            Err(e) => {
                let message = e.to_string();
                ctx.fail_stage("parsing", &message, Some(ErrorCode::ParseFailed.as_str()));
                return Err((ErrorCode::ParseFailed, message));
            },
        };

        let trimmed_len = parsed.text.trim().chars().count();
        if trimmed_len < self.min_text_length {
            // A multi-page document yielding almost no text is an image scan
            let code = if route.file_type == crate::services::router_service::FileType::Pdf
                && trimmed_len < 20
                && route.page_count >= 1
            {
                ErrorCode::ScannedImage
            } else {
                ErrorCode::TextTooShort
            };
            let message = format!("extracted only {} chars of text", trimmed_len);
            ctx.fail_stage("parsing", &message, Some(code.as_str()));
            return Err((code, message));
        }

        ctx.set_parsed_text(parsed.text.clone(), None);
        ctx.parsed_data.parsing_method = parsed.method.clone();
        ctx.parsed_data.page_count = parsed.page_count;
        ctx.parsed_data.parsing_confidence = if parsed.page_count > 0 { 0.9 } else { 0.7 };
        // Raw bytes are no longer needed past this point
        ctx.raw_input.clear_bytes();

        ctx.complete_stage(
            "parsing",
            json!({
                "text_length": trimmed_len,
                "page_count": parsed.page_count,
                "parse_method": parsed.method,
                "file_type": route.file_type.as_str(),
            }),
        );
        Ok(())
    }

    async fn stage_pii_extraction(&self, ctx: &mut PipelineContext) {
        ctx.start_stage("pii_extraction", "pii_extractor");
        ctx.extract_pii();

        if let Some(name) = ctx.pii_store.name.clone() {
            let confidence = ctx.pii_store.name_confidence;
            let source = ctx
                .pii_store
                .name_source
                .map(|s| s.as_str())
                .unwrap_or("regex");
            ctx.propose("pii_extractor", "name", json!(name), confidence, source);
        }
        if let Some(phone) = ctx.pii_store.phone.clone() {
            let confidence = ctx.pii_store.phone_confidence;
            ctx.propose("pii_extractor", "phone", json!(phone), confidence, "regex");
        }
        if let Some(email) = ctx.pii_store.email.clone() {
            let confidence = ctx.pii_store.email_confidence;
            ctx.propose("pii_extractor", "email", json!(email), confidence, "regex");
        }

        ctx.complete_stage(
            "pii_extraction",
            json!({
                "name": ctx.pii_store.name.is_some(),
                "phone": ctx.pii_store.phone.is_some(),
                "email": ctx.pii_store.email.is_some(),
            }),
        );
    }

    /// Progressive status: the pre-created row (if any) flips to `parsed`
    /// with the quick-extracted payload, and the webhook fires.
    async fn emit_parsed(&self, ctx: &mut PipelineContext, request: &PipelineRequest) {
        if let Some(candidate_id) = &request.candidate_id {
            let quick = json!({
                "name": ctx.pii_store.name,
                "phone": ctx.pii_store.phone.as_deref().map(|p| {
                    crate::services::privacy_service::mask_phone(p).0
                }),
                "email": ctx.pii_store.email.as_deref().map(|e| {
                    crate::services::privacy_service::mask_email(e).0
                }),
            });
            self.database
                .update_candidate_status(candidate_id, CandidateStatus::Parsed, Some(&quick))
                .await
                .ok();
        }
        self.webhooks.notify(&request.job_id, WebhookStatus::Parsed, None, None).await;
    }

    /// Returns Some((code, message)) when the document must be rejected.
    async fn stage_identity_check(
        &self,
        ctx: &mut PipelineContext,
    ) -> Option<(ErrorCode, String)> {
        ctx.start_stage("identity_check", "identity_checker");

        let check = pii_service::check_identities(&ctx.parsed_data.raw_text);
        if check.should_reject {
            let message = format!(
                "multi identity detected: {} persons ({})",
                check.person_count, check.reason
            );
            ctx.fail_stage("identity_check", &message, Some(ErrorCode::MultiIdentity.as_str()));
            ctx.warnings.add(
                WarningCode::DataIncomplete,
                message.clone(),
                WarningSeverity::Error,
            );
            return Some((ErrorCode::MultiIdentity, message));
        }

        ctx.complete_stage(
            "identity_check",
            json!({"person_count": check.person_count}),
        );
        None
    }

    async fn stage_analysis(
        &self,
        ctx: &mut PipelineContext,
        mode: AnalysisMode,
    ) -> Result<(), (ErrorCode, String)> {
        ctx.start_stage("analysis", "analyst");

        // Only the masked text crosses the LLM boundary
        let text = ctx.text_for_llm().to_string();
        let filename = ctx.raw_input.filename.clone();

        let result = self.analyst.analyze(&text, mode, Some(&filename)).await;

        if !result.success || result.data.is_null() {
            let error = result.error.unwrap_or_else(|| "analysis failed".to_string());
            let code = ErrorCode::classify(&error);
            let code = if code.is_retryable() { code } else { ErrorCode::LlmError };
            ctx.fail_stage("analysis", &error, Some(code.as_str()));
            return Err((code, error));
        }

        // Account tokens per provider for guardrails, metadata and metrics
        for (provider, usage) in &result.per_provider_usage {
            let tokens = (usage.input_tokens + usage.output_tokens) as u64;
            ctx.record_llm_call("analysis", tokens, 0.0);
            ctx.stage_results
                .record_tokens("analysis", usage.input_tokens, usage.output_tokens);
            self.metrics.record_llm_call(
                provider,
                &usage.model,
                usage.input_tokens as u64,
                usage.output_tokens as u64,
            );
        }

        let use_evidence = self.flags.current().use_evidence_tracking;
        let scalar_fields = [
            "exp_years",
            "current_company",
            "current_position",
            "last_company",
            "last_position",
            "summary",
            "match_reason",
            "education_level",
            "education_school",
            "education_major",
            "birth_year",
            "location_city",
            "portfolio_url",
            "github_url",
            "linkedin_url",
        ];
        for field in scalar_fields {
            let Some(value) = result.data.get(field).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            let confidence =
                result.field_confidence.get(field).copied().unwrap_or(0.7);
            if use_evidence {
                ctx.add_evidence(field, value.clone(), "analyst", confidence, "LLM extraction", "");
            }
            ctx.propose("analyst", field, value, confidence, "LLM extraction");
        }

        for field in ["careers", "educations", "skills", "certifications", "projects", "strengths"]
        {
            let Some(value) = result
                .data
                .get(field)
                .filter(|v| v.as_array().map(|a| !a.is_empty()).unwrap_or(false))
                .cloned()
            else {
                continue;
            };
            let confidence = result.field_confidence.get(field).copied().unwrap_or(0.7);
            ctx.propose("analyst", field, value, confidence, "LLM extraction");
        }

        for warning in &result.warnings {
            let (code, severity) = match warning.warning_type.as_str() {
                "mismatch" => (
                    WarningCode::Mismatch,
                    if warning.severity == "high" {
                        WarningSeverity::Error
                    } else {
                        WarningSeverity::Warning
                    },
                ),
                "mismatch_resolved" => (WarningCode::MismatchResolved, WarningSeverity::Info),
                "timeout" => (WarningCode::TimeoutWarning, WarningSeverity::Warning),
                _ => (WarningCode::DataIncomplete, WarningSeverity::Info),
            };
            ctx.warnings.add_for_field(code, &warning.field, warning.message.clone(), severity);
        }

        ctx.complete_stage(
            "analysis",
            json!({
                "confidence_score": result.confidence_score,
                "warning_count": result.warnings.len(),
                "providers": result.providers_used,
                "mode": result.mode.as_str(),
            }),
        );
        Ok(())
    }

    async fn emit_analyzed(&self, request: &PipelineRequest) {
        if let Some(candidate_id) = &request.candidate_id {
            self.database
                .update_candidate_status(candidate_id, CandidateStatus::Analyzed, None)
                .await
                .ok();
        }
        self.webhooks.notify(&request.job_id, WebhookStatus::Analyzed, None, None).await;
    }

    async fn stage_validation(&self, ctx: &mut PipelineContext) {
        ctx.start_stage("validation", "validation_agent");

        let decisions = ctx.decide_all();
        let analyzed: Value = Value::Object(
            decisions
                .iter()
                .filter(|d| !d.final_value.is_null())
                .map(|d| (d.field_name.clone(), d.final_value.clone()))
                .collect(),
        );

        let outcome = self.validator.validate(&analyzed, &ctx.parsed_data.raw_text).await;

        for correction in outcome.regex_corrections.iter().chain(&outcome.llm_corrections) {
            tracing::info!(
                "[orchestrator] {} correction: {} -> {}",
                correction.rule,
                correction.original,
                correction.corrected
            );
        }

        // Re-propose fields the validator changed
        if let Value::Object(validated) = &outcome.validated_data {
            for (field, value) in validated {
                let before = analyzed.get(field);
                if before != Some(value) {
                    let adjustment =
                        outcome.confidence_adjustments.get(field).copied().unwrap_or(0.0);
                    ctx.propose(
                        "validation_agent",
                        field,
                        value.clone(),
                        (0.8 + adjustment).clamp(0.0, 1.0),
                        "rule/LLM validation",
                    );
                }
            }
        }

        // Hallucination detection over the high-risk scalar fields
        if self.flags.current().use_hallucination_detection {
            for field in ["exp_years", "current_company", "current_position"] {
                if let Some(value) = analyzed.get(field).filter(|v| !v.is_null()).cloned() {
                    ctx.verify_hallucination(field, &value, "analyst");
                }
            }
        }

        ctx.complete_stage(
            "validation",
            json!({
                "regex_corrections": outcome.regex_corrections.len(),
                "llm_validations": outcome.llm_validations,
                "llm_corrections": outcome.llm_corrections.len(),
                "hallucinations_detected": ctx.hallucination_detector.records().len(),
            }),
        );
    }

    async fn stage_privacy(&self, ctx: &mut PipelineContext) -> PrivacyStageOutput {
        ctx.start_stage("privacy", "privacy_agent");

        // Current decided payload plus the PII originals for masking
        ctx.decide_all();
        let mut data = ctx.current_data.data.to_value();
        data["name"] = json!(ctx.pii_store.name);
        data["phone"] = json!(ctx.pii_store.phone);
        data["email"] = json!(ctx.pii_store.email);

        let result = self.privacy.process(&data);
        let pii_count = result.pii_found.len();
        let pii_types: Vec<String> = result
            .pii_types()
            .iter()
            .map(|t| format!("{:?}", t).to_lowercase())
            .collect();

        for warning in &result.warnings {
            ctx.warnings.add_internal(WarningCode::PiiDetected, "privacy", warning.clone());
        }

        // Masked values become the displayable record
        let mut masked_contact = std::collections::HashMap::new();
        for field in ["phone", "email", "address", "summary", "careers", "projects"] {
            if let Some(value) = result.masked_data.get(field).filter(|v| !v.is_null()) {
                ctx.current_data.apply_field(field, value);
                if matches!(field, "phone" | "email" | "address") {
                    masked_contact.insert(field.to_string(), value.clone());
                }
            }
        }

        ctx.complete_stage(
            "privacy",
            json!({
                "pii_count": pii_count,
                "encrypted_fields": result.encrypted_store.keys().collect::<Vec<_>>(),
            }),
        );

        PrivacyStageOutput {
            pii_count,
            pii_types,
            encrypted_store: result.encrypted_store,
            masked_contact,
        }
    }

    async fn stage_embedding(&self, ctx: &mut PipelineContext) -> EmbeddingStageOutput {
        ctx.start_stage("embedding", "embedding_service");

        let data = ctx.current_data.data.to_value();
        let raw_text = ctx.parsed_data.raw_text.clone();
        let outcome = self.embedder.process_candidate(&data, true, Some(&raw_text)).await;

        for warning in &outcome.warnings {
            if warning.starts_with("TRUNCATION") {
                ctx.warnings.add(
                    WarningCode::Truncation,
                    warning.clone(),
                    WarningSeverity::Warning,
                );
            } else {
                ctx.warnings.add(
                    WarningCode::EmbeddingFailed,
                    warning.clone(),
                    WarningSeverity::Warning,
                );
            }
        }

        if !outcome.success {
            // Embedding failure degrades the job, never fails it
            ctx.warnings.add_default(WarningCode::EmbeddingFailed, WarningSeverity::Warning);
            ctx.complete_stage("embedding", json!({"error": outcome.error}));
            return EmbeddingStageOutput { chunk_count: 0, tokens: 0, chunks: Vec::new() };
        }

        ctx.complete_stage(
            "embedding",
            json!({
                "chunk_count": outcome.total_chunks,
                "embedded": outcome.embedded_chunks,
                "failed": outcome.failed_chunks,
                "total_tokens": outcome.total_tokens,
            }),
        );

        EmbeddingStageOutput {
            chunk_count: outcome.total_chunks,
            tokens: outcome.total_tokens,
            chunks: outcome.chunks,
        }
    }

    async fn stage_save(
        &self,
        ctx: &mut PipelineContext,
        request: &PipelineRequest,
        privacy: &PrivacyStageOutput,
        embedding: &EmbeddingStageOutput,
    ) -> Result<SaveStageOutput, (ErrorCode, String)> {
        ctx.start_stage("save", "database");

        ctx.decide_all();
        let mut analyzed_data = ctx.current_data.data.to_value();
        privacy.apply_masks(&mut analyzed_data);

        // Masked name stays displayable; record a warning when absent
        if ctx.pii_store.name.is_none() {
            ctx.warnings.add_missing_required("name");
        } else {
            analyzed_data["name"] = json!(ctx.pii_store.name);
        }

        let dedup_keys = DedupKeys {
            phone_hash: ctx.pii_store.phone.as_deref().map(|p| self.privacy_hash(p)),
            email_hash: ctx.pii_store.email.as_deref().map(|e| self.privacy_hash(e)),
            name: ctx.pii_store.name.clone(),
            phone: ctx.pii_store.phone.clone(),
            birth_year: ctx.current_data.data.birth_year,
        };

        let field_confidence: Value = Value::Object(
            ctx.current_data
                .confidence_scores
                .iter()
                .map(|(field, pct)| (field.clone(), json!(*pct as f64 / 100.0)))
                .collect(),
        );
        ctx.current_data.calculate_overall_confidence();
        let confidence_score = ctx.current_data.overall_confidence as f64 / 100.0;
        let warnings_json = json!(
            ctx.warnings
                .user_visible()
                .iter()
                .map(|w| json!({
                    "code": w.code.as_str(),
                    "message": w.message,
                    "severity": w.severity.as_str(),
                    "field": w.field_name,
                }))
                .collect::<Vec<_>>()
        );

        let mut compensation = CompensationLog::new();
        let save_result = self
            .database
            .save_candidate(
                &request.user_id,
                &analyzed_data,
                confidence_score,
                &field_confidence,
                &warnings_json,
                &privacy.encrypted_store,
                &dedup_keys,
                &request.filename,
                &ctx.raw_input.file_extension,
                ctx.metadata.mode.as_str(),
                request.candidate_id.as_deref(),
                &mut compensation,
            )
            .await;

        let record = match save_result {
            Ok(record) => record,
            Err(DbError::RaceCondition) => {
                compensation.rollback(self.database.pool()).await;
                ctx.fail_stage("save", "race condition", Some(ErrorCode::RaceCondition.as_str()));
                return Err((ErrorCode::RaceCondition, "candidate already updated".to_string()));
            },
            Err(DbError::MissingRequiredFields(field)) => {
                compensation.rollback(self.database.pool()).await;
                let message = format!("missing required fields: {}", field);
                ctx.fail_stage("save", &message, Some(ErrorCode::MissingRequiredFields.as_str()));
                return Err((ErrorCode::MissingRequiredFields, message));
            },
            Err(e) => {
                compensation.rollback(self.database.pool()).await;
                ctx.fail_stage("save", &e.to_string(), Some(ErrorCode::DbSaveFailed.as_str()));
                return Err((ErrorCode::DbSaveFailed, e.to_string()));
            },
        };

        // Replace-all chunk semantics: the superseded version's chunks go
        // away, then the new set lands. Failed-embedding chunks are
        // excluded so the record is never searchable over them.
        if let Some(parent_id) = &record.parent_id {
            self.database.delete_chunks(parent_id).await.ok();
        }
        self.database.delete_chunks(&record.candidate_id).await.ok();

        let storable: Vec<_> = embedding
            .chunks
            .iter()
            .filter(|chunk| chunk.embedding.is_some())
            .cloned()
            .collect();
        let chunks_saved = match self
            .database
            .save_chunks(&record.candidate_id, &storable, &mut compensation)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                compensation.rollback(self.database.pool()).await;
                ctx.fail_stage("save", &e.to_string(), Some(ErrorCode::DbSaveFailed.as_str()));
                return Err((ErrorCode::DbSaveFailed, e.to_string()));
            },
        };

        // Credit: exactly once, first successful save only. Updates and
        // explicit skips never debit.
        if !request.skip_credit_deduction && !record.is_update {
            match self.database.deduct_credit(&request.user_id, Some(&record.candidate_id)).await {
                Ok(true) => {},
                Ok(false) => {
                    tracing::warn!(
                        "[orchestrator] credit debit failed post-save for {}",
                        request.user_id
                    );
                },
                Err(e) => tracing::error!("[orchestrator] credit debit error: {}", e),
            }
        }

        compensation.commit();

        ctx.complete_stage(
            "save",
            json!({
                "candidate_id": record.candidate_id,
                "chunks_saved": chunks_saved,
                "is_update": record.is_update,
            }),
        );

        Ok(SaveStageOutput {
            candidate_id: record.candidate_id,
            chunks_saved,
            is_update: record.is_update,
            parent_id: record.parent_id,
        })
    }

    fn privacy_hash(&self, value: &str) -> String {
        self.privacy.hash_for_dedup(value)
    }

    // ========================================================================
    // Error terminators
    // ========================================================================

    /// Permanent failure: job marked failed, candidate row soft-deleted,
    /// `failed` webhook emitted.
    async fn fail(
        &self,
        ctx: &mut PipelineContext,
        request: &PipelineRequest,
        code: ErrorCode,
        raw_error: &str,
        start: chrono::DateTime<Utc>,
    ) -> OrchestratorOutcome {
        self.terminate(ctx, request, code, raw_error, start, WebhookStatus::Failed, false)
            .await
    }

    /// Rejection: no credit consumed, `rejected` webhook emitted.
    async fn reject(
        &self,
        ctx: &mut PipelineContext,
        request: &PipelineRequest,
        code: ErrorCode,
        raw_error: &str,
        start: chrono::DateTime<Utc>,
    ) -> OrchestratorOutcome {
        self.terminate(ctx, request, code, raw_error, start, WebhookStatus::Rejected, true)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn terminate(
        &self,
        ctx: &mut PipelineContext,
        request: &PipelineRequest,
        code: ErrorCode,
        raw_error: &str,
        start: chrono::DateTime<Utc>,
        status: WebhookStatus,
        rejected: bool,
    ) -> OrchestratorOutcome {
        let pipeline_id = ctx.metadata.pipeline_id.clone();
        ctx.metadata.fail();
        ctx.audit_log.log_error("orchestrator", "pipeline", raw_error);
        self.metrics.complete_pipeline(&pipeline_id, false, Some(code.as_str()));

        let user_message = code.user_message().to_string();
        let job_status = if rejected { "rejected" } else { "failed" };

        self.database
            .update_job_status(
                &request.job_id,
                job_status,
                None,
                Some(code.as_str()),
                Some(&user_message),
            )
            .await
            .ok();

        // A pre-created candidate row is soft deleted so a dead record
        // never surfaces as latest
        if let Some(candidate_id) = &request.candidate_id {
            self.database
                .soft_delete_candidate(candidate_id, code.as_str(), &user_message)
                .await
                .ok();
        }

        self.webhooks.notify(&request.job_id, status, None, Some(&user_message)).await;

        tracing::error!(
            "[orchestrator] pipeline {} terminated: {} ({})",
            pipeline_id,
            code.as_str(),
            raw_error
        );

        OrchestratorOutcome {
            success: false,
            rejected,
            error: Some(raw_error.to_string()),
            error_code: Some(code.as_str().to_string()),
            user_message: Some(user_message),
            processing_time_ms: (Utc::now() - start).num_milliseconds(),
            pipeline_id,
            warnings: ctx.warnings.user_visible().iter().map(|w| w.message.clone()).collect(),
            context_summary: self.flags.current().debug_pipeline.then(|| ctx.status_summary()),
            ..Default::default()
        }
    }
}

/// Pre-parsed text entry (the `/analyze` and `/process` surfaces).
pub struct ProcessTextRequest {
    pub text: String,
    pub user_id: String,
    pub job_id: Option<String>,
    pub mode: AnalysisMode,
    pub generate_embeddings: bool,
    pub mask_pii: bool,
    pub save_to_db: bool,
    pub source_file: Option<String>,
    pub file_type: Option<String>,
}

struct PrivacyStageOutput {
    pii_count: usize,
    pii_types: Vec<String>,
    encrypted_store: std::collections::HashMap<String, String>,
    /// Masked display values for the contact fields; re-applied at every
    /// assembly point so later decisions cannot resurface originals
    masked_contact: std::collections::HashMap<String, Value>,
}

impl PrivacyStageOutput {
    fn empty() -> Self {
        Self {
            pii_count: 0,
            pii_types: Vec::new(),
            encrypted_store: std::collections::HashMap::new(),
            masked_contact: std::collections::HashMap::new(),
        }
    }

    fn apply_masks(&self, data: &mut Value) {
        for (field, value) in &self.masked_contact {
            data[field.as_str()] = value.clone();
        }
    }
}

struct EmbeddingStageOutput {
    chunk_count: usize,
    tokens: u64,
    chunks: Vec<crate::services::embedding_service::Chunk>,
}

struct SaveStageOutput {
    candidate_id: String,
    chunks_saved: usize,
    is_update: bool,
    parent_id: Option<String>,
}
