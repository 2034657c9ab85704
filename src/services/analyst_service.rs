//! Resume analysis: multi-provider extraction with field-level cross-check.
//!
//! Two strategies. Progressive calls the primary provider alone and only
//! fans out when the confidence summary falls short; parallel calls every
//! configured provider at once. Either way the responses go through the
//! same merge rule: the primary payload is the base, critical fields are
//! cross-checked, non-critical gaps are filled first-non-null.

use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use super::llm::{ChatMessage, LlmClient, LlmProvider, LlmResponse};
use crate::config::AnalysisMode;

/// Fields that must survive a cross-check before a single-provider answer
/// is accepted.
pub const CRITICAL_FIELDS: [&str; 3] = ["name", "phone", "email"];

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("static regex")
});

/// Unified extraction schema sent to every provider.
pub static RESUME_JSON_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "name": "resume_extraction",
        "schema": {
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "phone": {"type": "string"},
                "email": {"type": "string"},
                "birth_year": {"type": "integer"},
                "location_city": {"type": "string"},
                "exp_years": {"type": "number"},
                "current_company": {"type": "string"},
                "current_position": {"type": "string"},
                "last_company": {"type": "string"},
                "last_position": {"type": "string"},
                "careers": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "company": {"type": "string"},
                            "position": {"type": "string"},
                            "department": {"type": "string"},
                            "start_date": {"type": "string"},
                            "end_date": {"type": "string"},
                            "is_current": {"type": "boolean"},
                            "description": {"type": "string"}
                        },
                        "required": ["company"]
                    }
                },
                "educations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "school": {"type": "string"},
                            "major": {"type": "string"},
                            "degree": {"type": "string"},
                            "graduation_year": {"type": "integer"}
                        },
                        "required": ["school"]
                    }
                },
                "skills": {"type": "array", "items": {"type": "string"}},
                "certifications": {"type": "array"},
                "projects": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "role": {"type": "string"},
                            "period": {"type": "string"},
                            "technologies": {"type": "array", "items": {"type": "string"}},
                            "description": {"type": "string"}
                        },
                        "required": ["name"]
                    }
                },
                "education_level": {"type": "string"},
                "education_school": {"type": "string"},
                "education_major": {"type": "string"},
                "summary": {"type": "string"},
                "strengths": {"type": "array", "items": {"type": "string"}},
                "match_reason": {"type": "string"},
                "portfolio_url": {"type": "string"},
                "github_url": {"type": "string"},
                "linkedin_url": {"type": "string"}
            },
            "additionalProperties": false
        }
    })
});

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalystWarning {
    pub warning_type: String,
    pub field: String,
    pub message: String,
    pub severity: String,
}

impl AnalystWarning {
    fn new(warning_type: &str, field: &str, message: String, severity: &str) -> Self {
        Self {
            warning_type: warning_type.to_string(),
            field: field.to_string(),
            message,
            severity: severity.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProviderUsage {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug)]
pub struct AnalysisResult {
    pub success: bool,
    pub data: Value,
    pub confidence_score: f64,
    pub field_confidence: HashMap<String, f64>,
    pub warnings: Vec<AnalystWarning>,
    pub processing_time_ms: i64,
    pub mode: AnalysisMode,
    pub error: Option<String>,
    pub total_input_tokens: u32,
    pub total_output_tokens: u32,
    pub providers_used: Vec<String>,
    pub per_provider_usage: HashMap<String, ProviderUsage>,
}

pub struct AnalystService {
    llm: Arc<LlmClient>,
    confidence_threshold: f64,
    use_parallel_llm: bool,
    use_conditional_llm: bool,
}

impl AnalystService {
    pub fn new(
        llm: Arc<LlmClient>,
        confidence_threshold: f64,
        use_parallel_llm: bool,
        use_conditional_llm: bool,
    ) -> Self {
        Self { llm, confidence_threshold, use_parallel_llm, use_conditional_llm }
    }

    pub async fn analyze(
        &self,
        resume_text: &str,
        mode: AnalysisMode,
        filename: Option<&str>,
    ) -> AnalysisResult {
        let start = Utc::now();
        tracing::info!(
            "[analyst] starting analysis (mode: {}, text: {} chars)",
            mode.as_str(),
            resume_text.chars().count()
        );

        let messages = create_messages(resume_text, filename);

        let outcome = if self.use_parallel_llm || !self.use_conditional_llm {
            self.parallel_call(&messages, mode).await
        } else {
            self.progressive_call(&messages, mode).await
        };

        let processing_time_ms = (Utc::now() - start).num_milliseconds();

        match outcome {
            Ok(merged) => {
                tracing::info!(
                    "[analyst] completed in {}ms, confidence {:.2}, tokens in={} out={}",
                    processing_time_ms,
                    merged.confidence,
                    merged.input_tokens,
                    merged.output_tokens
                );
                AnalysisResult {
                    success: true,
                    field_confidence: field_confidence_from(&merged.data, merged.confidence),
                    data: merged.data,
                    confidence_score: merged.confidence,
                    warnings: merged.warnings,
                    processing_time_ms,
                    mode,
                    error: None,
                    total_input_tokens: merged.input_tokens,
                    total_output_tokens: merged.output_tokens,
                    providers_used: merged.providers_used,
                    per_provider_usage: merged.per_provider_usage,
                }
            },
            Err(error) => AnalysisResult {
                success: false,
                data: Value::Null,
                confidence_score: 0.0,
                field_confidence: HashMap::new(),
                warnings: Vec::new(),
                processing_time_ms,
                mode,
                error: Some(error),
                total_input_tokens: 0,
                total_output_tokens: 0,
                providers_used: Vec::new(),
                per_provider_usage: HashMap::new(),
            },
        }
    }

    /// Primary provider first; escalate only when the confidence summary
    /// falls below the threshold or a critical field is missing. Phase 2
    /// adds a third provider for deep verification.
    async fn progressive_call(
        &self,
        messages: &[ChatMessage],
        mode: AnalysisMode,
    ) -> Result<MergedAnalysis, String> {
        let available = self.llm.available_providers();
        if available.is_empty() {
            return Err("no LLM providers configured".to_string());
        }

        let mut responses: HashMap<LlmProvider, LlmResponse> = HashMap::new();

        // Step 1: primary, with the secondary promoted on outright failure
        let primary_order: Vec<LlmProvider> = available.clone();
        let mut primary = None;
        for provider in &primary_order {
            let response = self.call_provider(*provider, messages).await;
            let success = response.success();
            responses.insert(*provider, response);
            if success {
                primary = Some(*provider);
                break;
            }
            tracing::warn!("[analyst] {} failed as primary, promoting next", provider.as_str());
        }
        let Some(primary) = primary else {
            return Err("all primary providers failed".to_string());
        };

        let (confidence, missing) = evaluate_first_response(&responses[&primary]);
        tracing::info!(
            "[analyst] primary {} confidence {:.2}, missing {:?}",
            primary.as_str(),
            confidence,
            missing
        );

        if confidence >= self.confidence_threshold && missing.is_empty() {
            tracing::info!("[analyst] single model sufficient, skipping cross-check");
            let mut merged = merge_responses(&responses, primary);
            merged.confidence = confidence;
            merged.warnings.push(AnalystWarning::new(
                "optimization",
                "llm_calls",
                "Single model result accepted (high confidence)".to_string(),
                "info",
            ));
            return Ok(merged);
        }

        // Step 2: secondary cross-check
        if let Some(secondary) = available.iter().find(|p| !responses.contains_key(*p)) {
            let response = self.call_provider(*secondary, messages).await;
            responses.insert(*secondary, response);
        }

        let mut merged = merge_responses(&responses, primary);

        // Step 3: Phase 2 deep verification when still uncertain
        if mode == AnalysisMode::Phase2 && merged.confidence < self.confidence_threshold {
            if let Some(third) = available.iter().find(|p| !responses.contains_key(*p)) {
                tracing::info!("[analyst] phase_2 deep verification via {}", third.as_str());
                let response = self.call_provider(*third, messages).await;
                responses.insert(*third, response);
                merged = merge_responses(&responses, primary);
            }
        }

        if merged.data.is_null() {
            return Err("all LLM providers failed to extract data".to_string());
        }
        Ok(merged)
    }

    /// Fan out to every provider for the mode at once.
    async fn parallel_call(
        &self,
        messages: &[ChatMessage],
        mode: AnalysisMode,
    ) -> Result<MergedAnalysis, String> {
        let providers = self.providers_for(mode)?;
        tracing::info!(
            "[analyst] parallel calling {} providers: {:?}",
            providers.len(),
            providers.iter().map(|p| p.as_str()).collect::<Vec<_>>()
        );

        let calls = providers.iter().map(|p| self.call_provider(*p, messages));
        let results = join_all(calls).await;

        let mut responses = HashMap::new();
        for (provider, response) in providers.iter().zip(results) {
            if response.success() {
                tracing::info!("[analyst] {}: success", provider.as_str());
            } else {
                tracing::warn!(
                    "[analyst] {}: failed - {}",
                    provider.as_str(),
                    response.error.as_deref().unwrap_or("unknown")
                );
            }
            responses.insert(*provider, response);
        }

        let primary = providers[0];
        let merged = merge_responses(&responses, primary);
        if merged.data.is_null() {
            return Err("all LLM providers failed to extract data".to_string());
        }
        Ok(merged)
    }

    fn providers_for(&self, mode: AnalysisMode) -> Result<Vec<LlmProvider>, String> {
        let available = self.llm.available_providers();
        let required: &[LlmProvider] = match mode {
            AnalysisMode::Phase1 => &[LlmProvider::Openai, LlmProvider::Gemini],
            AnalysisMode::Phase2 => {
                &[LlmProvider::Openai, LlmProvider::Gemini, LlmProvider::Claude]
            },
        };

        let providers: Vec<LlmProvider> =
            required.iter().copied().filter(|p| available.contains(p)).collect();
        if !providers.is_empty() {
            return Ok(providers);
        }
        if let Some(first) = available.first() {
            return Ok(vec![*first]);
        }
        Err("no LLM providers available".to_string())
    }

    async fn call_provider(&self, provider: LlmProvider, messages: &[ChatMessage]) -> LlmResponse {
        self.llm.call_structured(provider, messages, &RESUME_JSON_SCHEMA, 0.1, 8192).await
    }
}

// ============================================================================
// Prompt
// ============================================================================

fn create_messages(text: &str, filename: Option<&str>) -> Vec<ChatMessage> {
    let system = "You are an expert Resume Parser. Extract ALL information from the resume.\n\
                  Return a single JSON object with all extracted fields. If a field is not \
                  found, omit it.\n\
                  IMPORTANT: Generate a high-quality 'match_reason' (one sentence) that \
                  explains why this candidate is a strong hire for their target roles."
        .to_string();

    let user = format!(
        "Extract all information from this resume:\n\nFilename: {}\n\n---\n{}\n---\n\nReturn valid JSON only.",
        filename.unwrap_or("Unknown"),
        text
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

// ============================================================================
// Confidence summary
// ============================================================================

/// Score the first response: format-check each critical field (1.0 valid,
/// 0.7 uncertain, 0.0 invalid), average, then up to +0.2 presence bonus.
pub fn evaluate_first_response(response: &LlmResponse) -> (f64, Vec<&'static str>) {
    let Some(data) = response.content.as_ref().filter(|_| response.success()) else {
        return (0.0, CRITICAL_FIELDS.to_vec());
    };

    let mut missing = Vec::new();
    let mut score = 0.0;

    for field in CRITICAL_FIELDS {
        let value = data.get(field).and_then(Value::as_str).map(str::trim).unwrap_or("");
        if value.is_empty() {
            missing.push(field);
            continue;
        }
        let (valid, field_score) = validate_field_value(field, value);
        if valid {
            score += field_score;
        } else {
            missing.push(field);
        }
    }

    let mut confidence = score / CRITICAL_FIELDS.len() as f64;

    let non_empty_array =
        |key: &str| data.get(key).and_then(Value::as_array).map(|a| !a.is_empty()).unwrap_or(false);
    if non_empty_array("careers") {
        confidence += 0.05;
    }
    if non_empty_array("skills") {
        confidence += 0.05;
    }
    if non_empty_array("educations") {
        confidence += 0.05;
    }
    if data
        .get("match_reason")
        .and_then(Value::as_str)
        .map(|s| s.chars().count() > 10)
        .unwrap_or(false)
    {
        confidence += 0.05;
    }

    (confidence.min(1.0), missing)
}

fn validate_field_value(field: &str, value: &str) -> (bool, f64) {
    match field {
        "email" => {
            if EMAIL_SHAPE.is_match(value) {
                (true, 1.0)
            } else if value.contains('@') {
                (true, 0.7)
            } else {
                (false, 0.0)
            }
        },
        "phone" => {
            let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
            if digits >= 9 {
                (true, 1.0)
            } else if digits >= 7 {
                (true, 0.7)
            } else {
                (false, 0.0)
            }
        },
        "name" => {
            const SUSPICIOUS: [&str; 10] = [
                "unknown", "n/a", "none", "null", "미상", "비공개", "수신인", "recipient",
                "test", "sample",
            ];
            let lower = value.to_lowercase();
            if SUSPICIOUS.iter().any(|p| lower.contains(p)) || value.chars().count() <= 1 {
                (false, 0.0)
            } else if value.chars().count() > 20 {
                (true, 0.7)
            } else {
                (true, 1.0)
            }
        },
        _ => (true, 1.0),
    }
}

// ============================================================================
// Merge rule
// ============================================================================

struct MergedAnalysis {
    data: Value,
    confidence: f64,
    warnings: Vec<AnalystWarning>,
    input_tokens: u32,
    output_tokens: u32,
    providers_used: Vec<String>,
    per_provider_usage: HashMap<String, ProviderUsage>,
}

/// Merge n responses. The primary payload is the base; critical fields are
/// cross-checked by normalized comparison; non-critical keys absent in the
/// base are filled first-non-null from the other providers.
fn merge_responses(
    responses: &HashMap<LlmProvider, LlmResponse>,
    primary: LlmProvider,
) -> MergedAnalysis {
    let mut warnings = Vec::new();
    let (input_tokens, output_tokens, providers_used, per_provider_usage) =
        collect_token_usage(responses);

    for (provider, response) in responses {
        if let Some(error) = &response.error {
            if error.to_lowercase().contains("timeout") {
                warnings.push(AnalystWarning::new(
                    "timeout",
                    provider.as_str(),
                    format!("{} API timeout - the request may still have been billed", provider.as_str()),
                    "high",
                ));
            } else {
                warnings.push(AnalystWarning::new(
                    "llm_error",
                    provider.as_str(),
                    format!("{} API error: {:.100}", provider.as_str(), error),
                    "medium",
                ));
            }
        }
    }

    let valid: Vec<(&LlmProvider, &LlmResponse)> =
        responses.iter().filter(|(_, r)| r.success()).collect();

    if valid.is_empty() {
        warnings.push(AnalystWarning::new(
            "critical",
            "all",
            "All LLM providers failed".to_string(),
            "high",
        ));
        return MergedAnalysis {
            data: Value::Null,
            confidence: 0.0,
            warnings,
            input_tokens,
            output_tokens,
            providers_used,
            per_provider_usage,
        };
    }

    // Base payload: the primary if it succeeded, otherwise any survivor
    let base_provider = if responses.get(&primary).map(|r| r.success()).unwrap_or(false) {
        primary
    } else {
        *valid[0].0
    };
    let mut base = responses[&base_provider]
        .content
        .clone()
        .expect("validated above");

    if valid.len() == 1 {
        warnings.push(AnalystWarning::new(
            "info",
            "cross_check",
            "Only one provider available".to_string(),
            "low",
        ));
        return MergedAnalysis {
            data: base,
            confidence: 0.7,
            warnings,
            input_tokens,
            output_tokens,
            providers_used,
            per_provider_usage,
        };
    }

    let mut confidence_sum = 0.0;
    let mut field_count = 0usize;

    for field in CRITICAL_FIELDS {
        // (provider, normalized value, original value)
        let mut values: Vec<(&str, String, Value)> = Vec::new();
        for (provider, response) in &valid {
            if let Some(value) = response.content.as_ref().and_then(|c| c.get(field)) {
                let normalized = normalize_for_compare(value);
                if !normalized.is_empty() {
                    values.push((provider.as_str(), normalized, value.clone()));
                }
            }
        }

        match values.len() {
            0 => {},
            1 => {
                confidence_sum += 0.7;
                field_count += 1;
            },
            2 => {
                field_count += 1;
                if values[0].1 == values[1].1 {
                    confidence_sum += 1.0;
                } else {
                    confidence_sum += 0.5;
                    warnings.push(AnalystWarning::new(
                        "mismatch",
                        field,
                        format!("Values differ: '{}' vs '{}'", values[0].1, values[1].1),
                        "medium",
                    ));
                }
            },
            _ => {
                field_count += 1;
                let mut counts: HashMap<&str, Vec<&str>> = HashMap::new();
                for (provider, normalized, _) in &values {
                    counts.entry(normalized.as_str()).or_default().push(*provider);
                }

                if counts.len() == 1 {
                    confidence_sum += 1.0;
                } else if counts.values().any(|members| members.len() >= 2) {
                    // Majority: adopt the winning value, name the dissenters
                    let majority_value: String = counts
                        .iter()
                        .max_by_key(|(_, members)| members.len())
                        .map(|(value, _)| value.to_string())
                        .expect("non-empty counts");
                    let dissenters: Vec<&str> = values
                        .iter()
                        .filter(|(_, normalized, _)| *normalized != majority_value)
                        .map(|(provider, _, _)| *provider)
                        .collect();

                    if let Some((_, _, winning)) =
                        values.iter().find(|(_, normalized, _)| *normalized == majority_value)
                    {
                        base[field] = winning.clone();
                    }
                    confidence_sum += 0.85;
                    warnings.push(AnalystWarning::new(
                        "mismatch_resolved",
                        field,
                        format!("Majority vote applied; dissent from {:?}", dissenters),
                        "low",
                    ));
                } else {
                    // All differ: keep the base value, flag loudly
                    confidence_sum += 0.4;
                    let rendering: Vec<String> = values
                        .iter()
                        .map(|(provider, normalized, _)| format!("{}='{}'", provider, normalized))
                        .collect();
                    warnings.push(AnalystWarning::new(
                        "mismatch",
                        field,
                        format!("All providers disagree: {}", rendering.join(", ")),
                        "high",
                    ));
                }
            },
        }
    }

    // Non-critical fill: first non-null from the other providers
    for (provider, response) in &valid {
        if **provider == base_provider {
            continue;
        }
        if let Some(Value::Object(map)) = response.content.as_ref() {
            for (key, value) in map {
                if value.is_null() {
                    continue;
                }
                let absent = base.get(key).map(Value::is_null).unwrap_or(true);
                if absent {
                    base[key.as_str()] = value.clone();
                }
            }
        }
    }

    let confidence =
        if field_count > 0 { confidence_sum / field_count as f64 } else { 0.8 };

    MergedAnalysis {
        data: base,
        confidence,
        warnings,
        input_tokens,
        output_tokens,
        providers_used,
        per_provider_usage,
    }
}

fn normalize_for_compare(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_lowercase(),
    }
}

fn collect_token_usage(
    responses: &HashMap<LlmProvider, LlmResponse>,
) -> (u32, u32, Vec<String>, HashMap<String, ProviderUsage>) {
    let mut total_input = 0;
    let mut total_output = 0;
    let mut providers_used = Vec::new();
    let mut per_provider = HashMap::new();

    for (provider, response) in responses {
        providers_used.push(provider.as_str().to_string());
        let (input, output) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        total_input += input;
        total_output += output;
        per_provider.insert(
            provider.as_str().to_string(),
            ProviderUsage {
                model: response.model.clone(),
                input_tokens: input,
                output_tokens: output,
            },
        );
    }

    providers_used.sort();
    (total_input, total_output, providers_used, per_provider)
}

fn field_confidence_from(data: &Value, base_confidence: f64) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    let Some(object) = data.as_object() else { return map };
    for (key, value) in object {
        if !value.is_null() {
            map.insert(key.clone(), base_confidence);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::TokenUsage;

    fn response(provider: LlmProvider, content: Value) -> LlmResponse {
        LlmResponse {
            provider,
            content: Some(content),
            raw_text: String::new(),
            model: format!("{}-model", provider.as_str()),
            usage: Some(TokenUsage { prompt_tokens: 100, completion_tokens: 50, total_tokens: 150 }),
            error: None,
        }
    }

    fn failed(provider: LlmProvider, error: &str) -> LlmResponse {
        LlmResponse::failure(provider, "m", error)
    }

    #[test]
    fn test_evaluate_first_response_full_marks() {
        let r = response(
            LlmProvider::Openai,
            json!({
                "name": "김철수",
                "phone": "010-1234-5678",
                "email": "kim@example.com",
                "careers": [{"company": "Acme"}],
                "skills": ["Rust"],
                "educations": [{"school": "SNU"}],
                "match_reason": "Deep systems experience with production Rust"
            }),
        );
        let (confidence, missing) = evaluate_first_response(&r);
        assert!(missing.is_empty());
        assert!(confidence >= 0.85);
    }

    #[test]
    fn test_evaluate_first_response_missing_critical() {
        let r = response(LlmProvider::Openai, json!({"name": "김철수"}));
        let (confidence, missing) = evaluate_first_response(&r);
        assert_eq!(missing, vec!["phone", "email"]);
        assert!(confidence < 0.85);
    }

    #[test]
    fn test_suspicious_name_rejected() {
        assert_eq!(validate_field_value("name", "Unknown").0, false);
        assert_eq!(validate_field_value("name", "미상").0, false);
        assert_eq!(validate_field_value("name", "K").0, false);
        assert!(validate_field_value("name", "김철수").0);
    }

    #[test]
    fn test_merge_two_way_agreement() {
        let mut responses = HashMap::new();
        responses.insert(
            LlmProvider::Openai,
            response(
                LlmProvider::Openai,
                json!({"name": "Kim Chulsoo", "phone": "010-1234-5678", "email": "k@e.com"}),
            ),
        );
        responses.insert(
            LlmProvider::Gemini,
            response(
                LlmProvider::Gemini,
                json!({"name": "kim chulsoo", "phone": "010-1234-5678", "email": "k@e.com"}),
            ),
        );

        let merged = merge_responses(&responses, LlmProvider::Openai);
        assert_eq!(merged.confidence, 1.0);
        // Base formatting wins on agreement
        assert_eq!(merged.data["name"], "Kim Chulsoo");
        assert!(merged.warnings.iter().all(|w| w.warning_type != "mismatch"));
    }

    #[test]
    fn test_merge_two_way_disagreement_flags_mismatch() {
        let mut responses = HashMap::new();
        responses.insert(
            LlmProvider::Openai,
            response(
                LlmProvider::Openai,
                json!({"name": "Kim", "phone": "010-1234-5678", "email": "k@e.com"}),
            ),
        );
        responses.insert(
            LlmProvider::Gemini,
            response(
                LlmProvider::Gemini,
                json!({"name": "Kim", "phone": "010-1234-5679", "email": "k@e.com"}),
            ),
        );

        let merged = merge_responses(&responses, LlmProvider::Openai);
        // Base payload keeps its own phone
        assert_eq!(merged.data["phone"], "010-1234-5678");
        let mismatch: Vec<_> =
            merged.warnings.iter().filter(|w| w.warning_type == "mismatch").collect();
        assert_eq!(mismatch.len(), 1);
        assert_eq!(mismatch[0].field, "phone");
        // (1.0 + 0.5 + 1.0) / 3
        assert!((merged.confidence - 0.8333).abs() < 0.001);
    }

    #[test]
    fn test_merge_three_way_majority_names_dissenter() {
        let mut responses = HashMap::new();
        responses.insert(
            LlmProvider::Openai,
            response(
                LlmProvider::Openai,
                json!({"name": "Kim", "phone": "010-1111-2222", "email": "k@e.com"}),
            ),
        );
        responses.insert(
            LlmProvider::Gemini,
            response(
                LlmProvider::Gemini,
                json!({"name": "Kim", "phone": "010-9999-0000", "email": "k@e.com"}),
            ),
        );
        responses.insert(
            LlmProvider::Claude,
            response(
                LlmProvider::Claude,
                json!({"name": "Kim", "phone": "010-1111-2222", "email": "k@e.com"}),
            ),
        );

        let merged = merge_responses(&responses, LlmProvider::Openai);
        assert_eq!(merged.data["phone"], "010-1111-2222");
        let resolved: Vec<_> =
            merged.warnings.iter().filter(|w| w.warning_type == "mismatch_resolved").collect();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].message.contains("gemini"));
    }

    #[test]
    fn test_merge_three_way_all_differ() {
        let mut responses = HashMap::new();
        for (provider, phone) in [
            (LlmProvider::Openai, "010-1111-1111"),
            (LlmProvider::Gemini, "010-2222-2222"),
            (LlmProvider::Claude, "010-3333-3333"),
        ] {
            responses.insert(
                provider,
                response(provider, json!({"name": "Kim", "phone": phone, "email": "k@e.com"})),
            );
        }

        let merged = merge_responses(&responses, LlmProvider::Openai);
        // Base (primary) value retained
        assert_eq!(merged.data["phone"], "010-1111-1111");
        assert!(merged
            .warnings
            .iter()
            .any(|w| w.warning_type == "mismatch" && w.severity == "high"));
    }

    #[test]
    fn test_merge_fills_non_critical_gaps() {
        let mut responses = HashMap::new();
        responses.insert(
            LlmProvider::Openai,
            response(
                LlmProvider::Openai,
                json!({"name": "Kim", "phone": "010-1234-5678", "email": "k@e.com"}),
            ),
        );
        responses.insert(
            LlmProvider::Gemini,
            response(
                LlmProvider::Gemini,
                json!({
                    "name": "Kim", "phone": "010-1234-5678", "email": "k@e.com",
                    "summary": "Backend engineer", "exp_years": 7
                }),
            ),
        );

        let merged = merge_responses(&responses, LlmProvider::Openai);
        assert_eq!(merged.data["summary"], "Backend engineer");
        assert_eq!(merged.data["exp_years"], 7);
    }

    #[test]
    fn test_merge_all_failed() {
        let mut responses = HashMap::new();
        responses.insert(LlmProvider::Openai, failed(LlmProvider::Openai, "timeout after 120s"));
        responses.insert(LlmProvider::Gemini, failed(LlmProvider::Gemini, "503"));

        let merged = merge_responses(&responses, LlmProvider::Openai);
        assert!(merged.data.is_null());
        assert_eq!(merged.confidence, 0.0);
        assert!(merged.warnings.iter().any(|w| w.warning_type == "timeout"));
    }

    #[test]
    fn test_token_usage_summed_and_attributed() {
        let mut responses = HashMap::new();
        responses.insert(
            LlmProvider::Openai,
            response(LlmProvider::Openai, json!({"name": "Kim"})),
        );
        responses.insert(
            LlmProvider::Gemini,
            response(LlmProvider::Gemini, json!({"name": "Kim"})),
        );

        let (input, output, providers, per_provider) = collect_token_usage(&responses);
        assert_eq!(input, 200);
        assert_eq!(output, 100);
        assert_eq!(providers, vec!["gemini".to_string(), "openai".to_string()]);
        assert_eq!(per_provider["openai"].input_tokens, 100);
    }
}
