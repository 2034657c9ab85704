//! Hallucination detection: values with no textual basis in the source.
//!
//! Two detection paths: absence from the raw text, and disagreement across
//! providers for the same field.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HallucinationRecord {
    pub field_name: String,
    pub hallucinated_value: Value,
    pub detection_method: &'static str,
    pub severity: HallucinationSeverity,
    pub llm_provider: String,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HallucinationDetector {
    raw_text_lower: String,
    records: Vec<HallucinationRecord>,
}

impl HallucinationDetector {
    /// Fields checked against the source text.
    pub const VERIFIABLE_FIELDS: [&'static str; 7] =
        ["exp_years", "current_company", "current_position", "skills", "name", "phone", "email"];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, raw_text: &str) {
        self.raw_text_lower = raw_text.to_lowercase();
    }

    /// Verify a single value against the source text. Returns the record
    /// when a hallucination is detected.
    pub fn verify_against_text(
        &mut self,
        field_name: &str,
        value: &Value,
        llm_provider: &str,
    ) -> Option<&HallucinationRecord> {
        if self.raw_text_lower.is_empty() {
            return None;
        }

        let contained = self.value_in_text(field_name, value);
        if contained {
            return None;
        }

        tracing::warn!("[hallucination] {} = {} not found in source text", field_name, value);
        self.records.push(HallucinationRecord {
            field_name: field_name.to_string(),
            hallucinated_value: value.clone(),
            detection_method: "text_verification",
            severity: Self::severity_for(field_name),
            llm_provider: llm_provider.to_string(),
            resolved: false,
            timestamp: Utc::now(),
        });
        self.records.last()
    }

    /// Compare one field's values across providers; a lone dissenter against
    /// an otherwise-agreeing set is recorded as a cross-provider hallucination.
    pub fn cross_validate_llm_results(
        &mut self,
        field_name: &str,
        results: &HashMap<String, Value>,
    ) -> Option<&HallucinationRecord> {
        if results.len() < 2 {
            return None;
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for value in results.values() {
            *counts.entry(normalized(value)).or_insert(0) += 1;
        }
        let (majority, majority_count) = counts.iter().max_by_key(|(_, n)| **n)?;
        if *majority_count <= results.len() / 2 {
            return None;
        }

        let dissenter = results
            .iter()
            .find(|(_, value)| normalized(value) != *majority)?;

        self.records.push(HallucinationRecord {
            field_name: field_name.to_string(),
            hallucinated_value: dissenter.1.clone(),
            detection_method: "cross_llm",
            severity: Self::severity_for(field_name),
            llm_provider: dissenter.0.clone(),
            resolved: false,
            timestamp: Utc::now(),
        });
        self.records.last()
    }

    pub fn resolve(&mut self, field_name: &str) {
        for record in self.records.iter_mut().filter(|r| r.field_name == field_name) {
            record.resolved = true;
        }
    }

    pub fn records(&self) -> &[HallucinationRecord] {
        &self.records
    }

    pub fn unresolved_count(&self) -> usize {
        self.records.iter().filter(|r| !r.resolved).count()
    }

    fn value_in_text(&self, field_name: &str, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::Array(items) => {
                // An array counts as grounded when most elements are
                items.is_empty()
                    || items.iter().filter(|v| self.value_in_text(field_name, v)).count() * 2
                        >= items.len()
            },
            Value::Number(n) => {
                // Numbers (years of experience) rarely appear verbatim;
                // accept when the integer form appears anywhere
                let formatted = if let Some(i) = n.as_i64() {
                    i.to_string()
                } else {
                    n.to_string()
                };
                self.raw_text_lower.contains(&formatted)
            },
            Value::String(s) => {
                let needle = s.trim().to_lowercase();
                if needle.is_empty() {
                    return true;
                }
                if self.raw_text_lower.contains(&needle) {
                    return true;
                }
                // Fall back to token-level containment for multi-word values
                let tokens: Vec<&str> =
                    needle.split_whitespace().filter(|t| t.chars().count() > 1).collect();
                !tokens.is_empty()
                    && tokens.iter().filter(|t| self.raw_text_lower.contains(**t)).count() * 2
                        >= tokens.len()
            },
            other => self.raw_text_lower.contains(&other.to_string().to_lowercase()),
        }
    }

    fn severity_for(field_name: &str) -> HallucinationSeverity {
        match field_name {
            "name" | "phone" | "email" => HallucinationSeverity::Critical,
            "exp_years" | "current_company" | "current_position" => HallucinationSeverity::High,
            "skills" | "careers" => HallucinationSeverity::Medium,
            _ => HallucinationSeverity::Low,
        }
    }
}

fn normalized(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector_with(text: &str) -> HallucinationDetector {
        let mut d = HallucinationDetector::new();
        d.set_text(text);
        d
    }

    #[test]
    fn test_grounded_value_passes() {
        let mut d = detector_with("김철수는 네이버에서 백엔드 개발을 했습니다.");
        assert!(d.verify_against_text("current_company", &json!("네이버"), "openai").is_none());
        assert!(d.records().is_empty());
    }

    #[test]
    fn test_ungrounded_value_recorded() {
        let mut d = detector_with("Kim worked at Naver as a backend engineer.");
        let record = d.verify_against_text("current_company", &json!("Kakao"), "openai");
        assert!(record.is_some());
        assert_eq!(d.records().len(), 1);
        assert_eq!(d.records()[0].detection_method, "text_verification");
        assert_eq!(d.records()[0].severity, HallucinationSeverity::High);
    }

    #[test]
    fn test_numeric_field() {
        let mut d = detector_with("경력 7년의 개발자입니다.");
        assert!(d.verify_against_text("exp_years", &json!(7), "openai").is_none());
        assert!(d.verify_against_text("exp_years", &json!(12), "openai").is_some());
    }

    #[test]
    fn test_cross_llm_dissenter() {
        let mut d = HallucinationDetector::new();
        let mut results = HashMap::new();
        results.insert("openai".to_string(), json!("Naver"));
        results.insert("gemini".to_string(), json!("naver"));
        results.insert("claude".to_string(), json!("Kakao"));

        let record = d.cross_validate_llm_results("current_company", &results);
        assert!(record.is_some());
        let record = record.unwrap();
        assert_eq!(record.llm_provider, "claude");
        assert_eq!(record.detection_method, "cross_llm");
    }

    #[test]
    fn test_resolution() {
        let mut d = detector_with("some text");
        d.verify_against_text("name", &json!("Ghost"), "openai");
        assert_eq!(d.unresolved_count(), 1);
        d.resolve("name");
        assert_eq!(d.unresolved_count(), 0);
    }
}
