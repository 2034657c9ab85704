//! Evidence store: provenance for every LLM-extracted value.
//!
//! Each field keeps a bounded list of `Evidence` records pairing the value
//! with the provider, its reasoning and the text snippet that justified it.
//! Cross-validation compares the records per field and marks consensus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub field_name: String,
    pub value: Value,
    pub llm_provider: String,
    pub llm_reasoning: String,
    pub source_snippet: String,
    pub confidence: f64,
    pub validators: Vec<String>,
    pub cross_validated: bool,
    pub timestamp: DateTime<Utc>,
}

impl Evidence {
    fn add_validator(&mut self, validator: &str) {
        if !self.validators.iter().any(|v| v == validator) {
            self.validators.push(validator.to_string());
            self.cross_validated = self.validators.len() >= 2;
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CrossValidation {
    pub has_consensus: bool,
    pub consensus_value: Option<Value>,
    pub confidence: f64,
    /// Providers whose value differs from the consensus
    pub disagreements: Vec<String>,
}

#[derive(Debug, Default)]
pub struct EvidenceStore {
    evidences: HashMap<String, Vec<Evidence>>,
    max_per_field: usize,
}

impl EvidenceStore {
    pub const MAX_EVIDENCES_PER_FIELD: usize = 10;

    pub fn new() -> Self {
        Self { evidences: HashMap::new(), max_per_field: Self::MAX_EVIDENCES_PER_FIELD }
    }

    /// Add evidence from an LLM result. Returns false when the per-field
    /// bound is already reached.
    pub fn add_from_llm(
        &mut self,
        field_name: &str,
        value: Value,
        llm_provider: &str,
        confidence: f64,
        reasoning: &str,
        source_snippet: &str,
    ) -> bool {
        let list = self.evidences.entry(field_name.to_string()).or_default();
        if list.len() >= self.max_per_field {
            tracing::warn!("[evidence] field {} reached its evidence bound", field_name);
            return false;
        }

        list.push(Evidence {
            field_name: field_name.to_string(),
            value,
            llm_provider: llm_provider.to_string(),
            llm_reasoning: reasoning.to_string(),
            source_snippet: source_snippet.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            validators: vec![llm_provider.to_string()],
            cross_validated: false,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn get(&self, field_name: &str) -> &[Evidence] {
        self.evidences.get(field_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest-confidence record, preferring cross-validated ones.
    pub fn best(&self, field_name: &str) -> Option<&Evidence> {
        self.get(field_name).iter().max_by(|a, b| {
            (a.cross_validated, a.confidence)
                .partial_cmp(&(b.cross_validated, b.confidence))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Compare all records for a field; marks mutually-agreeing providers
    /// as each other's validators.
    pub fn cross_validate(&mut self, field_name: &str) -> CrossValidation {
        let Some(list) = self.evidences.get(field_name) else {
            return CrossValidation {
                has_consensus: false,
                consensus_value: None,
                confidence: 0.0,
                disagreements: Vec::new(),
            };
        };

        if list.len() == 1 {
            return CrossValidation {
                has_consensus: true,
                consensus_value: Some(list[0].value.clone()),
                confidence: list[0].confidence,
                disagreements: Vec::new(),
            };
        }

        // Group by string form; majority of records wins
        let mut counts: HashMap<String, usize> = HashMap::new();
        for e in list {
            *counts.entry(e.value.to_string()).or_insert(0) += 1;
        }
        let Some((winner_key, winner_count)) = counts.into_iter().max_by_key(|(_, n)| *n) else {
            return CrossValidation {
                has_consensus: false,
                consensus_value: None,
                confidence: 0.0,
                disagreements: Vec::new(),
            };
        };

        let consensus_ratio = winner_count as f64 / list.len() as f64;
        if consensus_ratio < 0.5 {
            return CrossValidation {
                has_consensus: false,
                consensus_value: None,
                confidence: 0.0,
                disagreements: Vec::new(),
            };
        }

        let consensus_value =
            list.iter().find(|e| e.value.to_string() == winner_key).map(|e| e.value.clone());
        let avg_confidence = list
            .iter()
            .filter(|e| e.value.to_string() == winner_key)
            .map(|e| e.confidence)
            .sum::<f64>()
            / winner_count as f64;
        let confidence = (avg_confidence * (1.0 + consensus_ratio * 0.2)).min(1.0);

        let disagreements: Vec<String> = list
            .iter()
            .filter(|e| e.value.to_string() != winner_key)
            .map(|e| e.llm_provider.clone())
            .collect();

        // Agreeing providers validate each other
        let agreeing: Vec<String> = list
            .iter()
            .filter(|e| e.value.to_string() == winner_key)
            .map(|e| e.llm_provider.clone())
            .collect();
        if let Some(list) = self.evidences.get_mut(field_name) {
            for e in list.iter_mut().filter(|e| e.value.to_string() == winner_key) {
                for provider in &agreeing {
                    if *provider != e.llm_provider {
                        e.add_validator(provider);
                    }
                }
            }
        }

        CrossValidation { has_consensus: true, consensus_value, confidence, disagreements }
    }

    pub fn fields(&self) -> Vec<&str> {
        self.evidences.keys().map(String::as_str).collect()
    }

    pub fn total_count(&self) -> usize {
        self.evidences.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_per_field_bound() {
        let mut store = EvidenceStore::new();
        for i in 0..12 {
            store.add_from_llm("skills", json!([i]), "openai", 0.8, "", "");
        }
        assert_eq!(store.get("skills").len(), EvidenceStore::MAX_EVIDENCES_PER_FIELD);
    }

    #[test]
    fn test_consensus_marks_cross_validated() {
        let mut store = EvidenceStore::new();
        store.add_from_llm("name", json!("Kim"), "openai", 0.9, "", "");
        store.add_from_llm("name", json!("Kim"), "gemini", 0.8, "", "");
        store.add_from_llm("name", json!("Lee"), "claude", 0.6, "", "");

        let result = store.cross_validate("name");
        assert!(result.has_consensus);
        assert_eq!(result.consensus_value, Some(json!("Kim")));
        assert_eq!(result.disagreements, vec!["claude".to_string()]);

        let best = store.best("name").unwrap();
        assert!(best.cross_validated);
        assert_eq!(best.value, json!("Kim"));
    }

    #[test]
    fn test_no_consensus_when_all_differ() {
        let mut store = EvidenceStore::new();
        store.add_from_llm("phone", json!("010-1111-2222"), "openai", 0.9, "", "");
        store.add_from_llm("phone", json!("010-3333-4444"), "gemini", 0.9, "", "");
        store.add_from_llm("phone", json!("010-5555-6666"), "claude", 0.9, "", "");

        let result = store.cross_validate("phone");
        assert!(!result.has_consensus);
        assert!(result.consensus_value.is_none());
    }

    #[test]
    fn test_single_record_is_its_own_consensus() {
        let mut store = EvidenceStore::new();
        store.add_from_llm("email", json!("a@b.com"), "openai", 0.95, "", "");

        let result = store.cross_validate("email");
        assert!(result.has_consensus);
        assert_eq!(result.confidence, 0.95);
        assert!(result.disagreements.is_empty());
    }
}
