//! The pipeline context: one owning hub per job.
//!
//! The orchestrator owns the context and hands each stage a mutable
//! borrow. Stages never talk to each other directly; anything another
//! stage needs to know goes through the decision manager, the warning
//! collector or the audit log.

use chrono::Utc;
use serde_json::{Value, json};

use super::audit::AuditLog;
use super::decision::{Decision, DecisionManager};
use super::evidence::EvidenceStore;
use super::guardrails::{GuardrailChecker, PipelineGuardrails};
use super::hallucination::HallucinationDetector;
use super::layers::{
    Checkpoint, CurrentData, ParsedData, PiiStore, PipelineMetadata, RawInput, StageResults,
};
use super::warnings::{PipelineWarning, WarningCollector};
use crate::services::pii_service;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("file size {0} exceeds the configured limit")]
    FileTooLarge(usize),
}

pub struct PipelineContext {
    pub raw_input: RawInput,
    pub parsed_data: ParsedData,
    pub pii_store: PiiStore,
    pub stage_results: StageResults,
    pub evidence_store: EvidenceStore,
    pub decision_manager: DecisionManager,
    pub current_data: CurrentData,
    pub hallucination_detector: HallucinationDetector,
    pub warnings: WarningCollector,
    pub audit_log: AuditLog,
    pub guardrails: GuardrailChecker,
    pub metadata: PipelineMetadata,
}

/// Final output of a finished pipeline run.
#[derive(Debug)]
pub struct FinalizedResult {
    pub candidate: Value,
    /// 0..=100
    pub confidence: u8,
    pub warnings: Vec<PipelineWarning>,
    pub pipeline_id: String,
    pub duration_ms: i64,
    pub llm_calls: u32,
    pub tokens_used: u64,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::with_guardrails(PipelineGuardrails::default())
    }

    pub fn with_guardrails(guardrails: PipelineGuardrails) -> Self {
        let mut metadata = PipelineMetadata::default();
        metadata.start();
        tracing::info!("[context] created: {}", metadata.pipeline_id);

        Self {
            raw_input: RawInput::default(),
            parsed_data: ParsedData::default(),
            pii_store: PiiStore::default(),
            stage_results: StageResults::default(),
            evidence_store: EvidenceStore::new(),
            decision_manager: DecisionManager::new(),
            current_data: CurrentData::default(),
            hallucination_detector: HallucinationDetector::new(),
            warnings: WarningCollector::new(),
            audit_log: AuditLog::default(),
            guardrails: GuardrailChecker::new(guardrails),
            metadata,
        }
    }

    // ========================================
    // Input
    // ========================================

    pub fn set_raw_input(
        &mut self,
        file_bytes: Vec<u8>,
        filename: &str,
        source: &str,
    ) -> Result<(), ContextError> {
        let size = file_bytes.len();
        if !self.guardrails.check_file_size(size) {
            return Err(ContextError::FileTooLarge(size));
        }

        self.raw_input.set_file(file_bytes, filename, source);
        self.audit_log.log_create(
            "system",
            "raw_input",
            json!({"filename": filename, "size": size}),
        );
        Ok(())
    }

    pub fn set_parsed_text(&mut self, raw_text: String, cleaned_text: Option<String>) {
        self.guardrails.check_text_length(raw_text.chars().count());
        self.hallucination_detector.set_text(&raw_text);
        let length = raw_text.chars().count();
        self.parsed_data.set_text(raw_text, cleaned_text);
        self.audit_log.log_create("parser", "parsed_data", json!({"text_length": length}));
    }

    // ========================================
    // PII
    // ========================================

    /// Regex-only PII extraction plus masked-text construction.
    pub fn extract_pii(&mut self) {
        if self.parsed_data.raw_text.is_empty() {
            tracing::warn!("[context] no parsed text, skipping PII extraction");
            return;
        }

        pii_service::extract_into(
            &mut self.pii_store,
            &self.parsed_data.raw_text,
            Some(&self.raw_input.filename),
        );
        let raw = self.parsed_data.raw_text.clone();
        self.pii_store.mask_for_llm(&raw);

        self.audit_log.log_create(
            "pii_extractor",
            "pii_store",
            json!({
                "name": self.pii_store.name.is_some(),
                "phone": self.pii_store.phone.is_some(),
                "email": self.pii_store.email.is_some(),
            }),
        );
    }

    /// Text that is allowed to cross the LLM boundary: the masked text when
    /// PII masking ran, otherwise the cleaned text.
    pub fn text_for_llm(&self) -> &str {
        match &self.pii_store.masked_text {
            Some(masked) => masked,
            None if !self.parsed_data.cleaned_text.is_empty() => &self.parsed_data.cleaned_text,
            None => &self.parsed_data.raw_text,
        }
    }

    // ========================================
    // Stages
    // ========================================

    pub fn start_stage(&mut self, stage_name: &str, agent_name: &str) {
        if let Some(started_at) = self.metadata.started_at {
            self.guardrails.check_total_timeout(started_at);
        }
        self.stage_results.start_stage(stage_name, agent_name);
        self.audit_log.log_create(
            if agent_name.is_empty() { "system" } else { agent_name },
            &format!("stage:{}", stage_name),
            json!({"status": "running"}),
        );
        tracing::info!("[context] stage started: {}", stage_name);
    }

    pub fn complete_stage(&mut self, stage_name: &str, output: Value) {
        self.stage_results.complete_stage(stage_name, output);
        self.audit_log.log_update(
            "system",
            &format!("stage:{}", stage_name),
            json!({"status": "running"}),
            json!({"status": "completed"}),
        );
        tracing::info!("[context] stage completed: {}", stage_name);
    }

    pub fn fail_stage(&mut self, stage_name: &str, error: &str, error_code: Option<&str>) {
        self.stage_results.fail_stage(stage_name, error, error_code);
        self.audit_log.log_error("system", &format!("stage:{}", stage_name), error);
        tracing::error!("[context] stage failed: {} - {}", stage_name, error);
    }

    // ========================================
    // Evidence and decisions
    // ========================================

    pub fn add_evidence(
        &mut self,
        field_name: &str,
        value: Value,
        llm_provider: &str,
        confidence: f64,
        reasoning: &str,
        source_snippet: &str,
    ) {
        self.evidence_store.add_from_llm(
            field_name,
            value.clone(),
            llm_provider,
            confidence,
            reasoning,
            source_snippet,
        );
        self.audit_log.log_create(
            llm_provider,
            &format!("evidence:{}", field_name),
            json!({"value": value, "confidence": confidence}),
        );
    }

    pub fn propose(
        &mut self,
        agent_name: &str,
        field_name: &str,
        value: Value,
        confidence: f64,
        reasoning: &str,
    ) {
        self.decision_manager.propose(agent_name, field_name, value.clone(), confidence, reasoning);
        self.audit_log.log_create(
            agent_name,
            &format!("proposal:{}", field_name),
            json!({"value": value, "confidence": confidence}),
        );
    }

    /// Decide a field and fold the result into `current_data`.
    pub fn decide(&mut self, field_name: &str) -> Decision {
        let decision = self.decision_manager.make_decision(field_name);

        if !decision.final_value.is_null() {
            self.current_data.apply_field(field_name, &decision.final_value);
            self.current_data.set_confidence(field_name, decision.final_confidence);
        }

        self.audit_log.log_decision(
            "decision_manager",
            &format!("decision:{}", field_name),
            decision.final_value.clone(),
            decision.method.as_str(),
        );

        if decision.had_conflict {
            self.warnings.add_llm_disagreement(field_name);
        }
        if decision.final_confidence < 0.6 && !decision.final_value.is_null() {
            self.warnings.add_low_confidence(field_name, decision.final_confidence);
        }

        decision
    }

    pub fn decide_all(&mut self) -> Vec<Decision> {
        let fields: Vec<String> =
            self.decision_manager.decide_all().into_iter().map(|d| d.field_name).collect();
        fields.iter().map(|f| self.decide(f)).collect()
    }

    // ========================================
    // Hallucination
    // ========================================

    /// Returns false when the value has no basis in the source text.
    pub fn verify_hallucination(&mut self, field_name: &str, value: &Value, provider: &str) -> bool {
        let detected = self
            .hallucination_detector
            .verify_against_text(field_name, value, provider)
            .is_some();
        if detected {
            self.warnings.add_hallucination(field_name);
        }
        !detected
    }

    // ========================================
    // LLM accounting
    // ========================================

    pub fn record_llm_call(&mut self, stage_name: &str, tokens: u64, cost_usd: f64) {
        self.guardrails.check_llm_calls(stage_name);
        self.guardrails.record_llm_call(stage_name);
        self.metadata.add_llm_usage(tokens, cost_usd);
    }

    // ========================================
    // Checkpoint
    // ========================================

    pub fn create_checkpoint(&mut self) -> Checkpoint {
        let checkpoint = Checkpoint {
            pipeline_id: self.metadata.pipeline_id.clone(),
            current_stage: self.stage_results.current_stage.clone(),
            completed_stages: self
                .stage_results
                .completed_stages()
                .into_iter()
                .map(str::to_string)
                .collect(),
            pii_name: self.pii_store.name.clone(),
            pii_phone: self.pii_store.phone.clone(),
            pii_email: self.pii_store.email.clone(),
            created_at: Utc::now(),
        };
        self.metadata.checkpoint = Some(checkpoint.clone());
        self.audit_log.log_create("system", "checkpoint", json!({
            "stage": checkpoint.current_stage,
        }));
        checkpoint
    }

    /// Restore PII and stage position from a checkpoint. Expired
    /// checkpoints (past the TTL) are refused.
    pub fn restore_from_checkpoint(&mut self, checkpoint: &Checkpoint) -> bool {
        let age = (Utc::now() - checkpoint.created_at).num_seconds();
        if age > self.metadata.checkpoint_ttl_seconds {
            tracing::warn!("[context] checkpoint expired: {}s old", age);
            return false;
        }

        self.metadata.pipeline_id = checkpoint.pipeline_id.clone();
        self.stage_results.current_stage = checkpoint.current_stage.clone();
        self.pii_store.name = checkpoint.pii_name.clone();
        self.pii_store.phone = checkpoint.pii_phone.clone();
        self.pii_store.email = checkpoint.pii_email.clone();

        self.audit_log.log(
            super::audit::AuditAction::Update,
            "system",
            "checkpoint",
            None,
            None,
            Some("restored".to_string()),
        );
        true
    }

    // ========================================
    // Finalization
    // ========================================

    /// Merge PII into the record, decide every open field, compute the
    /// overall confidence and close the run. Masked contact values set by
    /// the privacy stage are kept; PII originals only fill empty slots.
    pub fn finalize(&mut self) -> FinalizedResult {
        if self.current_data.data.name.is_none() {
            self.current_data.data.name = self.pii_store.name.clone();
        }
        if self.current_data.data.phone.is_none() {
            self.current_data.data.phone = self.pii_store.phone.clone();
        }
        if self.current_data.data.email.is_none() {
            self.current_data.data.email = self.pii_store.email.clone();
        }

        self.decide_all();
        let confidence = self.current_data.calculate_overall_confidence();
        self.metadata.complete();

        self.audit_log.log_update(
            "system",
            "pipeline",
            json!({"status": "running"}),
            json!({"status": "completed"}),
        );

        let warnings: Vec<PipelineWarning> =
            self.warnings.user_visible().into_iter().cloned().collect();

        tracing::info!(
            "[context] finalized: confidence={}, warnings={}",
            confidence,
            warnings.len()
        );

        FinalizedResult {
            candidate: self.current_data.data.to_value(),
            confidence,
            warnings,
            pipeline_id: self.metadata.pipeline_id.clone(),
            duration_ms: self.metadata.duration_ms(),
            llm_calls: self.metadata.total_llm_calls,
            tokens_used: self.metadata.total_tokens_used,
        }
    }

    /// Debug/status summary for the non-production debug endpoint.
    pub fn status_summary(&self) -> Value {
        json!({
            "pipeline_id": self.metadata.pipeline_id,
            "status": self.metadata.status.as_str(),
            "current_stage": self.stage_results.current_stage,
            "completed_stages": self.stage_results.completed_stages(),
            "failed_stages": self.stage_results.failed_stages(),
            "llm_calls": self.metadata.total_llm_calls,
            "warning_count": self.warnings.len(),
            "has_errors": self.warnings.has_errors(),
            "guardrail_violations": self.guardrails.has_violations(),
            "evidence_count": self.evidence_store.total_count(),
            "conflicts": self.decision_manager.conflict_count(),
        })
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_text() -> String {
        "김철수\n연락처: 010-1234-5678\n이메일: kim@example.com\n\
         네이버에서 7년간 백엔드 개발을 담당했습니다."
            .to_string()
    }

    #[test]
    fn test_pii_never_in_llm_text() {
        let mut ctx = PipelineContext::new();
        ctx.set_parsed_text(sample_text(), None);
        ctx.extract_pii();

        let llm_text = ctx.text_for_llm();
        assert!(!llm_text.contains("010-1234-5678"));
        assert!(!llm_text.contains("kim@example.com"));
    }

    #[test]
    fn test_text_for_llm_fallback_without_masking() {
        let mut ctx = PipelineContext::new();
        ctx.set_parsed_text("plain text body".to_string(), None);
        assert_eq!(ctx.text_for_llm(), "plain text body");
    }

    #[test]
    fn test_decide_folds_into_current_data() {
        let mut ctx = PipelineContext::new();
        ctx.propose("analyst_openai", "summary", json!("Seasoned backend engineer"), 0.9, "");
        let decision = ctx.decide("summary");

        assert!(!decision.had_conflict);
        assert_eq!(
            ctx.current_data.data.summary.as_deref(),
            Some("Seasoned backend engineer")
        );
        assert_eq!(ctx.current_data.confidence_scores.get("summary"), Some(&90));
    }

    #[test]
    fn test_conflict_produces_warning() {
        let mut ctx = PipelineContext::new();
        ctx.propose("analyst_openai", "phone", json!("010-1234-5678"), 0.9, "");
        ctx.propose("analyst_gemini", "phone", json!("010-1234-5679"), 0.9, "");
        let decision = ctx.decide("phone");

        assert!(decision.had_conflict);
        assert!(ctx
            .warnings
            .all()
            .iter()
            .any(|w| w.code == super::super::warnings::WarningCode::LlmDisagreement));
    }

    #[test]
    fn test_finalize_prefers_pii_store_identity() {
        let mut ctx = PipelineContext::new();
        ctx.set_parsed_text(sample_text(), None);
        ctx.extract_pii();

        // Analyst proposes a different name, but PII store wins at finalize
        ctx.propose("analyst_openai", "summary", json!("dev"), 0.8, "");
        let result = ctx.finalize();

        assert_eq!(result.candidate["name"], json!(ctx.pii_store.name.clone()));
        assert_eq!(result.candidate["phone"], json!("010-1234-5678"));
    }

    #[test]
    fn test_file_size_guardrail() {
        let mut ctx = PipelineContext::new();
        let oversized = vec![0u8; 51 * 1024 * 1024];
        assert!(ctx.set_raw_input(oversized, "big.pdf", "upload").is_err());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut ctx = PipelineContext::new();
        ctx.set_parsed_text(sample_text(), None);
        ctx.extract_pii();
        ctx.start_stage("analysis", "analyst");
        let checkpoint = ctx.create_checkpoint();

        let mut restored = PipelineContext::new();
        assert!(restored.restore_from_checkpoint(&checkpoint));
        assert_eq!(restored.pii_store.phone, ctx.pii_store.phone);
        assert_eq!(restored.stage_results.current_stage.as_deref(), Some("analysis"));
    }

    #[test]
    fn test_llm_call_accounting() {
        let mut ctx = PipelineContext::new();
        ctx.record_llm_call("analysis", 1200, 0.01);
        ctx.record_llm_call("analysis", 800, 0.01);

        assert_eq!(ctx.metadata.total_llm_calls, 2);
        assert_eq!(ctx.metadata.total_tokens_used, 2000);
        assert_eq!(ctx.guardrails.total_llm_calls(), 2);
    }
}
