//! Data layers of the pipeline context.
//!
//! Raw input is kept separate from parsed text, and parsed text from the
//! PII store, so hallucination checks can always compare against the
//! untouched source and plaintext PII never leaks into LLM prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::ResumeData;
use crate::utils::normalize_digits;

// ============================================================================
// Raw input
// ============================================================================

#[derive(Debug, Default)]
pub struct RawInput {
    /// Original bytes; releasable once parsing is done
    pub file_bytes: Option<Vec<u8>>,
    pub file_path: Option<String>,
    pub filename: String,
    pub file_extension: String,
    pub file_size: usize,
    pub source: String,
    pub upload_timestamp: Option<DateTime<Utc>>,
}

impl RawInput {
    pub fn set_file(&mut self, file_bytes: Vec<u8>, filename: &str, source: &str) {
        self.file_size = file_bytes.len();
        self.file_bytes = Some(file_bytes);
        self.filename = filename.to_string();
        self.file_extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        self.source = source.to_string();
        self.upload_timestamp = Some(Utc::now());
    }

    /// Release the original bytes once no stage needs them.
    pub fn clear_bytes(&mut self) {
        self.file_bytes = None;
    }
}

// ============================================================================
// Parsed data
// ============================================================================

#[derive(Debug, Default)]
pub struct ParsedData {
    pub raw_text: String,
    pub cleaned_text: String,
    pub text_length: usize,
    pub sections: HashMap<String, String>,
    pub parsing_confidence: f64,
    pub parsing_method: String,
    pub parsing_warnings: Vec<String>,
    pub page_count: u32,
}

impl ParsedData {
    pub fn set_text(&mut self, raw_text: String, cleaned_text: Option<String>) {
        self.text_length = raw_text.chars().count();
        self.cleaned_text = cleaned_text.unwrap_or_else(|| raw_text.clone());
        self.raw_text = raw_text;
    }
}

// ============================================================================
// PII store
// ============================================================================

/// Source of an extracted PII value, ordered by trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiSource {
    Filename,
    TextHeader,
    Regex,
}

impl PiiSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filename => "filename",
            Self::TextHeader => "text_header",
            Self::Regex => "regex",
        }
    }
}

/// Regex-extracted identity data. Never sent to any LLM in plaintext; the
/// masked text plus the reverse map is the only thing that crosses that
/// boundary.
#[derive(Debug, Default)]
pub struct PiiStore {
    pub name: Option<String>,
    pub name_confidence: f64,
    pub name_source: Option<PiiSource>,

    pub phone: Option<String>,
    pub phone_confidence: f64,

    pub email: Option<String>,
    pub email_confidence: f64,

    pub birth_year: Option<i32>,
    pub address: Option<String>,

    pub masked_text: Option<String>,
    /// placeholder -> original
    pub masking_map: HashMap<String, String>,

    pub extracted_at: Option<DateTime<Utc>>,
}

impl PiiStore {
    pub fn has_any(&self) -> bool {
        self.name.is_some() || self.phone.is_some() || self.email.is_some()
    }

    /// Replace extracted PII with placeholders. Phone numbers are replaced
    /// in every common digit formatting of the same number.
    pub fn mask_for_llm(&mut self, text: &str) -> &str {
        let mut masked = text.to_string();
        self.masking_map.clear();

        if let Some(name) = &self.name {
            masked = masked.replace(name.as_str(), "[NAME]");
            self.masking_map.insert("[NAME]".to_string(), name.clone());
        }

        if let Some(phone) = &self.phone {
            for variant in phone_variants(phone) {
                masked = masked.replace(&variant, "[PHONE]");
            }
            self.masking_map.insert("[PHONE]".to_string(), phone.clone());
        }

        if let Some(email) = &self.email {
            masked = masked.replace(email.as_str(), "[EMAIL]");
            self.masking_map.insert("[EMAIL]".to_string(), email.clone());
        }

        self.masked_text = Some(masked);
        self.masked_text.as_deref().expect("just set")
    }

    pub fn unmask(&self, masked_text: &str) -> String {
        let mut restored = masked_text.to_string();
        for (placeholder, original) in &self.masking_map {
            restored = restored.replace(placeholder, original);
        }
        restored
    }
}

/// Formatting variants of one phone number: as extracted, digits only,
/// hyphenated and space separated.
pub fn phone_variants(phone: &str) -> Vec<String> {
    let mut variants = vec![phone.to_string()];
    let digits = normalize_digits(phone);
    if digits.len() == 11 {
        variants.push(digits.clone());
        variants.push(format!("{}-{}-{}", &digits[..3], &digits[3..7], &digits[7..]));
        variants.push(format!("{} {} {}", &digits[..3], &digits[3..7], &digits[7..]));
    } else if digits.len() == 10 {
        variants.push(digits.clone());
        variants.push(format!("{}-{}-{}", &digits[..3], &digits[3..6], &digits[6..]));
        variants.push(format!("{} {} {}", &digits[..3], &digits[3..6], &digits[6..]));
    } else if !digits.is_empty() {
        variants.push(digits);
    }
    variants.dedup();
    variants
}

// ============================================================================
// Stage results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage_name: String,
    pub agent_name: String,
    pub status: StageStatus,
    pub output: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl StageResult {
    fn new(stage_name: &str, agent_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            agent_name: agent_name.to_string(),
            status: StageStatus::Pending,
            output: Value::Null,
            started_at: None,
            completed_at: None,
            duration_ms: 0,
            tokens_input: 0,
            tokens_output: 0,
            retry_count: 0,
            error: None,
            error_code: None,
        }
    }

    fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    fn finish(&mut self, status: StageStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_ms = (end - start).num_milliseconds();
        }
    }
}

/// Canonical stage order.
pub const STAGES: [&str; 8] = [
    "parsing",
    "pii_extraction",
    "identity_check",
    "analysis",
    "validation",
    "privacy",
    "embedding",
    "save",
];

#[derive(Debug, Default)]
pub struct StageResults {
    results: HashMap<String, StageResult>,
    execution_order: Vec<String>,
    pub current_stage: Option<String>,
}

impl StageResults {
    pub fn start_stage(&mut self, stage_name: &str, agent_name: &str) {
        let result = self
            .results
            .entry(stage_name.to_string())
            .or_insert_with(|| StageResult::new(stage_name, agent_name));
        result.start();
        self.current_stage = Some(stage_name.to_string());
    }

    pub fn complete_stage(&mut self, stage_name: &str, output: Value) {
        if let Some(result) = self.results.get_mut(stage_name) {
            result.output = output;
            result.finish(StageStatus::Completed);
            if !self.execution_order.iter().any(|s| s == stage_name) {
                self.execution_order.push(stage_name.to_string());
            }
        }
    }

    pub fn fail_stage(&mut self, stage_name: &str, error: &str, error_code: Option<&str>) {
        if let Some(result) = self.results.get_mut(stage_name) {
            result.error = Some(error.to_string());
            result.error_code = error_code.map(str::to_string);
            result.finish(StageStatus::Failed);
        }
    }

    pub fn skip_stage(&mut self, stage_name: &str, agent_name: &str) {
        let result = self
            .results
            .entry(stage_name.to_string())
            .or_insert_with(|| StageResult::new(stage_name, agent_name));
        result.finish(StageStatus::Skipped);
    }

    pub fn record_tokens(&mut self, stage_name: &str, input: u32, output: u32) {
        if let Some(result) = self.results.get_mut(stage_name) {
            result.tokens_input += input;
            result.tokens_output += output;
        }
    }

    pub fn record_retry(&mut self, stage_name: &str) {
        if let Some(result) = self.results.get_mut(stage_name) {
            result.retry_count += 1;
        }
    }

    pub fn get(&self, stage_name: &str) -> Option<&StageResult> {
        self.results.get(stage_name)
    }

    pub fn completed_stages(&self) -> Vec<&str> {
        STAGES
            .iter()
            .copied()
            .filter(|s| {
                self.results.get(*s).map(|r| r.status == StageStatus::Completed).unwrap_or(false)
            })
            .collect()
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        STAGES
            .iter()
            .copied()
            .filter(|s| {
                self.results.get(*s).map(|r| r.status == StageStatus::Failed).unwrap_or(false)
            })
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &StageResult> {
        self.results.values()
    }
}

// ============================================================================
// Current data
// ============================================================================

/// Field weights for the overall confidence score.
pub const CONFIDENCE_WEIGHTS: [(&str, f64); 6] = [
    ("name", 0.15),
    ("exp_years", 0.20),
    ("careers", 0.25),
    ("skills", 0.20),
    ("educations", 0.10),
    ("summary", 0.10),
];

/// Progressively constructed candidate record plus per-field confidence
/// (percent, 0-100).
#[derive(Debug, Default)]
pub struct CurrentData {
    pub data: ResumeData,
    pub confidence_scores: HashMap<String, u8>,
    pub overall_confidence: u8,
}

impl CurrentData {
    pub fn set_confidence(&mut self, field_name: &str, confidence: f64) {
        let pct = (confidence.clamp(0.0, 1.0) * 100.0).round() as u8;
        self.confidence_scores.insert(field_name.to_string(), pct);
    }

    /// Weighted mean over the configured subset; absent fields drop from
    /// both numerator and denominator.
    pub fn calculate_overall_confidence(&mut self) -> u8 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;

        for (field, weight) in CONFIDENCE_WEIGHTS {
            if let Some(score) = self.confidence_scores.get(field) {
                total += *score as f64 * weight;
                weight_sum += weight;
            }
        }

        self.overall_confidence =
            if weight_sum > 0.0 { (total / weight_sum).round() as u8 } else { 0 };
        self.overall_confidence
    }

    /// Apply a decided field value onto the typed record.
    pub fn apply_field(&mut self, field_name: &str, value: &Value) {
        let mut as_value = self.data.to_value();
        if let Value::Object(map) = &mut as_value {
            map.insert(field_name.to_string(), value.clone());
            self.data = ResumeData::from_merged(&as_value);
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_id: String,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub pii_name: Option<String>,
    pub pii_phone: Option<String>,
    pub pii_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PipelineMetadata {
    pub pipeline_id: String,
    pub candidate_id: Option<String>,
    pub job_id: Option<String>,
    pub user_id: Option<String>,
    pub mode: String,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: StageStatus,

    pub total_llm_calls: u32,
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,

    pub checkpoint: Option<Checkpoint>,
    pub checkpoint_ttl_seconds: i64,
}

impl Default for PipelineMetadata {
    fn default() -> Self {
        Self {
            pipeline_id: String::new(),
            candidate_id: None,
            job_id: None,
            user_id: None,
            mode: "phase_1".to_string(),
            started_at: None,
            completed_at: None,
            status: StageStatus::Pending,
            total_llm_calls: 0,
            total_tokens_used: 0,
            total_cost_usd: 0.0,
            checkpoint: None,
            checkpoint_ttl_seconds: 120,
        }
    }
}

impl PipelineMetadata {
    pub fn start(&mut self) {
        self.pipeline_id = format!("pipeline_{}", Utc::now().timestamp_micros());
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = StageStatus::Completed;
    }

    pub fn fail(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = StageStatus::Failed;
    }

    pub fn add_llm_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.total_llm_calls += 1;
        self.total_tokens_used += tokens;
        self.total_cost_usd += cost_usd;
    }

    pub fn duration_ms(&self) -> i64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }

    pub fn is_checkpoint_valid(&self) -> bool {
        self.checkpoint
            .as_ref()
            .map(|cp| (Utc::now() - cp.created_at).num_seconds() <= self.checkpoint_ttl_seconds)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_input_extension() {
        let mut input = RawInput::default();
        input.set_file(vec![1, 2, 3], "resume_Kim.PDF", "upload");
        assert_eq!(input.file_extension, "pdf");
        assert_eq!(input.file_size, 3);

        input.clear_bytes();
        assert!(input.file_bytes.is_none());
        assert_eq!(input.file_size, 3);
    }

    #[test]
    fn test_phone_variants() {
        let variants = phone_variants("010-1234-5678");
        assert!(variants.contains(&"010-1234-5678".to_string()));
        assert!(variants.contains(&"01012345678".to_string()));
        assert!(variants.contains(&"010 1234 5678".to_string()));
    }

    #[test]
    fn test_masking_roundtrip() {
        let mut store = PiiStore {
            name: Some("김철수".to_string()),
            phone: Some("010-1234-5678".to_string()),
            email: Some("kim@example.com".to_string()),
            ..Default::default()
        };

        let text = "김철수 / 01012345678 / kim@example.com 입니다.";
        let masked = store.mask_for_llm(text).to_string();
        assert!(!masked.contains("김철수"));
        assert!(!masked.contains("01012345678"));
        assert!(!masked.contains("kim@example.com"));
        assert!(masked.contains("[NAME]"));
        assert!(masked.contains("[PHONE]"));
        assert!(masked.contains("[EMAIL]"));

        let restored = store.unmask(&masked);
        assert_eq!(restored, text);
    }

    #[test]
    fn test_stage_lifecycle() {
        let mut results = StageResults::default();
        results.start_stage("parsing", "router");
        assert_eq!(results.current_stage.as_deref(), Some("parsing"));

        results.complete_stage("parsing", json!({"page_count": 2}));
        assert_eq!(results.completed_stages(), vec!["parsing"]);

        results.start_stage("analysis", "analyst");
        results.fail_stage("analysis", "all providers failed", Some("LLM_ERROR"));
        assert_eq!(results.failed_stages(), vec!["analysis"]);
        let analysis = results.get("analysis").unwrap();
        assert_eq!(analysis.error_code.as_deref(), Some("LLM_ERROR"));
    }

    #[test]
    fn test_overall_confidence_weighted_mean() {
        let mut current = CurrentData::default();
        current.set_confidence("name", 1.0);
        current.set_confidence("exp_years", 0.8);
        current.set_confidence("careers", 0.9);
        current.set_confidence("skills", 0.7);
        current.set_confidence("educations", 0.6);
        current.set_confidence("summary", 0.5);

        let overall = current.calculate_overall_confidence();
        // (100*.15 + 80*.20 + 90*.25 + 70*.20 + 60*.10 + 50*.10) / 1.0 = 78.5
        assert_eq!(overall, 79);
    }

    #[test]
    fn test_overall_confidence_drops_absent_fields() {
        let mut current = CurrentData::default();
        current.set_confidence("name", 0.9);
        current.set_confidence("skills", 0.9);

        // (90*.15 + 90*.20) / 0.35 = 90
        assert_eq!(current.calculate_overall_confidence(), 90);
    }

    #[test]
    fn test_apply_field() {
        let mut current = CurrentData::default();
        current.apply_field("name", &json!("Kim"));
        current.apply_field("skills", &json!(["Rust"]));
        assert_eq!(current.data.name.as_deref(), Some("Kim"));
        assert_eq!(current.data.skills, vec!["Rust".to_string()]);
    }

    #[test]
    fn test_checkpoint_ttl() {
        let mut meta = PipelineMetadata::default();
        assert!(!meta.is_checkpoint_valid());

        meta.checkpoint = Some(Checkpoint {
            pipeline_id: "p".to_string(),
            current_stage: None,
            completed_stages: vec![],
            pii_name: None,
            pii_phone: None,
            pii_email: None,
            created_at: Utc::now(),
        });
        assert!(meta.is_checkpoint_valid());

        meta.checkpoint.as_mut().unwrap().created_at =
            Utc::now() - chrono::Duration::seconds(121);
        assert!(!meta.is_checkpoint_valid());
    }
}
