//! Field validation: deterministic rules first, optional LLM verification
//! on top.
//!
//! Rule layer: format checks for the contact fields, date normalization to
//! YYYY-MM, degree canonicalization, company-name cleanup. LLM layer: asks
//! a model whether each complex field is supported by a bounded excerpt of
//! the original text, applying suggested corrections and small confidence
//! adjustments. The cross-validation engine repeats the check on several
//! providers and reports the agreement rate.

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use super::llm::{ChatMessage, LlmClient, LlmProvider};
use crate::utils::truncate_chars;

/// Fields worth an LLM verification pass.
pub const LLM_VERIFIABLE_FIELDS: [&str; 6] =
    ["exp_years", "current_company", "current_position", "careers", "skills", "summary"];

const EXCERPT_CHARS: usize = 2000;

static DATE_YM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[./\-년\s]*(\d{1,2})?").expect("static regex"));
static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("static regex")
});
static COMPANY_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\(주\)|\(주\)$|주식회사\s*|\s*(inc|llc|ltd|co\.,? ltd)\.?$")
        .expect("static regex")
});

#[derive(Debug, Clone, serde::Serialize)]
pub struct Correction {
    pub field: String,
    pub original: Value,
    pub corrected: Value,
    pub rule: &'static str,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlmFieldVerdict {
    pub is_valid: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub found_in_text: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_correction: Option<Value>,
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub validated_data: Value,
    pub regex_corrections: Vec<Correction>,
    pub llm_corrections: Vec<Correction>,
    pub llm_validations: usize,
    /// field -> adjustment applied to its confidence (clamped by caller)
    pub confidence_adjustments: HashMap<String, f64>,
    pub providers_used: Vec<String>,
}

pub struct ValidatorService {
    llm: Arc<LlmClient>,
    use_llm_validation: bool,
}

impl ValidatorService {
    pub fn new(llm: Arc<LlmClient>, use_llm_validation: bool) -> Self {
        Self { llm, use_llm_validation }
    }

    /// Full validation pass over a decided payload.
    pub async fn validate(&self, data: &Value, original_text: &str) -> ValidationOutcome {
        let mut outcome = ValidationOutcome {
            validated_data: data.clone(),
            ..Default::default()
        };

        apply_rule_validations(&mut outcome);

        if self.use_llm_validation && !self.llm.available_providers().is_empty() {
            self.run_llm_validations(&mut outcome, original_text).await;
        }

        outcome
    }

    async fn run_llm_validations(&self, outcome: &mut ValidationOutcome, original_text: &str) {
        let excerpt = truncate_chars(original_text, EXCERPT_CHARS);
        let Some(provider) = self.llm.available_providers().first().copied() else {
            return;
        };
        outcome.providers_used.push(provider.as_str().to_string());

        for field in LLM_VERIFIABLE_FIELDS {
            let Some(value) = outcome.validated_data.get(field).filter(|v| !v.is_null()).cloned()
            else {
                continue;
            };

            let Some(verdict) = self.verify_field(provider, field, &value, excerpt).await else {
                continue;
            };
            outcome.llm_validations += 1;

            if !verdict.is_valid {
                if let Some(correction) = verdict.suggested_correction.filter(|c| !c.is_null()) {
                    tracing::info!(
                        "[validator] LLM correction on {}: {} -> {}",
                        field,
                        value,
                        correction
                    );
                    outcome.llm_corrections.push(Correction {
                        field: field.to_string(),
                        original: value,
                        corrected: correction.clone(),
                        rule: "llm_verification",
                    });
                    outcome.validated_data[field] = correction;
                }
                *outcome.confidence_adjustments.entry(field.to_string()).or_insert(0.0) -= 0.1;
            } else {
                *outcome.confidence_adjustments.entry(field.to_string()).or_insert(0.0) += 0.1;
            }
        }
    }

    async fn verify_field(
        &self,
        provider: LlmProvider,
        field: &str,
        value: &Value,
        excerpt: &str,
    ) -> Option<LlmFieldVerdict> {
        let messages = verification_messages(field, value, excerpt);
        let schema = verification_schema();
        let response = self.llm.call_structured(provider, &messages, &schema, 0.0, 1024).await;

        if !response.success() {
            tracing::warn!(
                "[validator] LLM verification of {} failed: {}",
                field,
                response.error.as_deref().unwrap_or("unknown")
            );
            return None;
        }
        serde_json::from_value(response.content?).ok()
    }

    /// Run the same field check on at least two providers and report how
    /// often they agree on validity.
    pub async fn cross_validate_field(
        &self,
        field: &str,
        value: &Value,
        original_text: &str,
    ) -> CrossValidationReport {
        let providers = self.llm.available_providers();
        if providers.len() < 2 {
            return CrossValidationReport {
                field: field.to_string(),
                verdicts: Vec::new(),
                agreement_rate: 0.0,
            };
        }

        let excerpt = truncate_chars(original_text, EXCERPT_CHARS);
        let calls = providers.iter().map(|p| {
            let provider = *p;
            async move {
                (provider, self.verify_field(provider, field, value, excerpt).await)
            }
        });
        let results = join_all(calls).await;

        let verdicts: Vec<(String, LlmFieldVerdict)> = results
            .into_iter()
            .filter_map(|(provider, verdict)| {
                verdict.map(|v| (provider.as_str().to_string(), v))
            })
            .collect();

        let agreement_rate = if verdicts.len() >= 2 {
            let valid_count = verdicts.iter().filter(|(_, v)| v.is_valid).count();
            let majority = valid_count.max(verdicts.len() - valid_count);
            majority as f64 / verdicts.len() as f64
        } else {
            0.0
        };

        CrossValidationReport { field: field.to_string(), verdicts, agreement_rate }
    }
}

#[derive(Debug)]
pub struct CrossValidationReport {
    pub field: String,
    pub verdicts: Vec<(String, LlmFieldVerdict)>,
    pub agreement_rate: f64,
}

fn verification_messages(field: &str, value: &Value, excerpt: &str) -> Vec<ChatMessage> {
    let system = "You verify extracted resume fields against the source text. \
                  Judge strictly: a field is valid only when the text supports it."
        .to_string();
    let user = format!(
        "Field: {}\nExtracted value: {}\n\nSource text (excerpt):\n---\n{}\n---\n\n\
         Does the text support this value? Respond with JSON.",
        field, value, excerpt
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn verification_schema() -> Value {
    json!({
        "name": "field_verification",
        "schema": {
            "type": "object",
            "properties": {
                "is_valid": {"type": "boolean"},
                "confidence": {"type": "number"},
                "found_in_text": {"type": "boolean"},
                "reasoning": {"type": "string"},
                "suggested_correction": {}
            },
            "required": ["is_valid"]
        }
    })
}

// ============================================================================
// Rule layer
// ============================================================================

fn apply_rule_validations(outcome: &mut ValidationOutcome) {
    let data = &mut outcome.validated_data;
    let corrections = &mut outcome.regex_corrections;

    // Contact formats: a malformed email is dropped rather than persisted
    if let Some(email) = data.get("email").and_then(Value::as_str) {
        if !email.is_empty() && !EMAIL_SHAPE.is_match(email) {
            corrections.push(Correction {
                field: "email".to_string(),
                original: json!(email),
                corrected: Value::Null,
                rule: "email_format",
            });
            data["email"] = Value::Null;
        }
    }

    // Career date normalization + company cleanup
    if let Some(careers) = data.get_mut("careers").and_then(Value::as_array_mut) {
        for career in careers {
            for key in ["start_date", "end_date"] {
                let Some(raw) = career.get(key).and_then(Value::as_str) else { continue };
                if raw.is_empty() {
                    continue;
                }
                if let Some(normalized) = normalize_date(raw) {
                    if normalized != raw {
                        corrections.push(Correction {
                            field: format!("careers.{}", key),
                            original: json!(raw),
                            corrected: json!(normalized),
                            rule: "date_format",
                        });
                        career[key] = json!(normalized);
                    }
                }
            }

            if let Some(company) = career.get("company").and_then(Value::as_str) {
                let canonical = canonicalize_company(company);
                if canonical != company {
                    corrections.push(Correction {
                        field: "careers.company".to_string(),
                        original: json!(company),
                        corrected: json!(canonical.clone()),
                        rule: "company_canonicalization",
                    });
                    career["company"] = json!(canonical);
                }
            }
        }
    }

    // Degree normalization
    if let Some(educations) = data.get_mut("educations").and_then(Value::as_array_mut) {
        for education in educations {
            let Some(degree) = education.get("degree").and_then(Value::as_str) else { continue };
            if let Some(normalized) = normalize_degree(degree) {
                if normalized != degree {
                    corrections.push(Correction {
                        field: "educations.degree".to_string(),
                        original: json!(degree),
                        corrected: json!(normalized),
                        rule: "degree_normalization",
                    });
                    education["degree"] = json!(normalized);
                }
            }
        }
    }

    if let Some(level) = data.get("education_level").and_then(Value::as_str) {
        if let Some(normalized) = normalize_degree(level) {
            if normalized != level {
                outcome.regex_corrections.push(Correction {
                    field: "education_level".to_string(),
                    original: json!(level),
                    corrected: json!(normalized),
                    rule: "degree_normalization",
                });
                outcome.validated_data["education_level"] = json!(normalized);
            }
        }
    }
}

/// Normalize assorted date spellings to YYYY-MM (YYYY alone becomes
/// YYYY-01).
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();
    if ["현재", "재직중", "present", "current", "now"].contains(&lowered.as_str()) {
        return Some(trimmed.to_string());
    }

    let captures = DATE_YM.captures(trimmed)?;
    let year: i32 = captures.get(1)?.as_str().parse().ok()?;
    if !(1950..=2100).contains(&year) {
        return None;
    }
    let month: u32 = captures
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .filter(|m| (1..=12).contains(m))
        .unwrap_or(1);
    Some(format!("{:04}-{:02}", year, month))
}

/// Map degree spellings across scripts onto canonical English labels.
pub fn normalize_degree(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let canonical = if lowered.contains("박사") || lowered.contains("doctor") || lowered.contains("ph.d")
        || lowered.contains("phd")
    {
        "Doctorate"
    } else if lowered.contains("석사") || lowered.contains("master") || lowered.contains("msc") {
        "Master"
    } else if lowered.contains("학사") || lowered.contains("bachelor") || lowered.contains("bsc") {
        "Bachelor"
    } else if lowered.contains("전문학사") || lowered.contains("associate") {
        "Associate"
    } else if lowered.contains("고졸") || lowered.contains("high school") {
        "HighSchool"
    } else {
        return None;
    };
    Some(canonical.to_string())
}

/// Strip incorporation noise from company names.
pub fn canonicalize_company(raw: &str) -> String {
    let cleaned = COMPANY_NOISE.replace_all(raw.trim(), "");
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn validator() -> ValidatorService {
        let llm = Arc::new(LlmClient::new(reqwest::Client::new(), LlmConfig::default()));
        ValidatorService::new(llm, false)
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2021.03").as_deref(), Some("2021-03"));
        assert_eq!(normalize_date("2021/3").as_deref(), Some("2021-03"));
        assert_eq!(normalize_date("2021-03-15").as_deref(), Some("2021-03"));
        assert_eq!(normalize_date("2021년 3월").as_deref(), Some("2021-03"));
        assert_eq!(normalize_date("2021").as_deref(), Some("2021-01"));
        assert_eq!(normalize_date("현재").as_deref(), Some("현재"));
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date("1800.01"), None);
    }

    #[test]
    fn test_normalize_degree() {
        assert_eq!(normalize_degree("석사").as_deref(), Some("Master"));
        assert_eq!(normalize_degree("Master of Science").as_deref(), Some("Master"));
        assert_eq!(normalize_degree("학사").as_deref(), Some("Bachelor"));
        assert_eq!(normalize_degree("Ph.D").as_deref(), Some("Doctorate"));
        assert_eq!(normalize_degree("무언가"), None);
    }

    #[test]
    fn test_canonicalize_company() {
        assert_eq!(canonicalize_company("(주)카카오"), "카카오");
        assert_eq!(canonicalize_company("주식회사 네이버"), "네이버");
        assert_eq!(canonicalize_company("Acme Inc."), "Acme");
        assert_eq!(canonicalize_company("Widgets Co., Ltd"), "Widgets");
        assert_eq!(canonicalize_company("PlainName"), "PlainName");
    }

    #[tokio::test]
    async fn test_rule_validation_pass() {
        let data = json!({
            "email": "broken-email",
            "careers": [{
                "company": "(주)카카오",
                "start_date": "2020.03",
                "end_date": "현재"
            }],
            "educations": [{"school": "SNU", "degree": "석사"}],
            "education_level": "석사"
        });

        let outcome = validator().validate(&data, "source text").await;

        assert!(outcome.validated_data["email"].is_null());
        assert_eq!(outcome.validated_data["careers"][0]["company"], "카카오");
        assert_eq!(outcome.validated_data["careers"][0]["start_date"], "2020-03");
        assert_eq!(outcome.validated_data["careers"][0]["end_date"], "현재");
        assert_eq!(outcome.validated_data["educations"][0]["degree"], "Master");
        assert_eq!(outcome.validated_data["education_level"], "Master");

        let rules: Vec<&str> = outcome.regex_corrections.iter().map(|c| c.rule).collect();
        assert!(rules.contains(&"email_format"));
        assert!(rules.contains(&"date_format"));
        assert!(rules.contains(&"company_canonicalization"));
        assert!(rules.contains(&"degree_normalization"));
    }

    #[tokio::test]
    async fn test_valid_email_untouched() {
        let data = json!({"email": "kim@example.com", "careers": [], "educations": []});
        let outcome = validator().validate(&data, "text").await;
        assert_eq!(outcome.validated_data["email"], "kim@example.com");
        assert!(outcome.regex_corrections.is_empty());
    }

    #[tokio::test]
    async fn test_cross_validate_needs_two_providers() {
        let report = validator().cross_validate_field("skills", &json!(["Rust"]), "text").await;
        assert_eq!(report.agreement_rate, 0.0);
        assert!(report.verdicts.is_empty());
    }
}
