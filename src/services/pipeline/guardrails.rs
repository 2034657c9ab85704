//! Pipeline guardrails: hard limits on time, LLM usage and input sizes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Limits for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineGuardrails {
    pub stage_timeout_seconds: i64,
    pub total_timeout_seconds: i64,
    pub max_llm_calls_per_stage: u32,
    pub max_total_llm_calls: u32,
    pub max_retries_per_stage: u32,
    pub max_evidence_per_field: usize,
    pub max_audit_entries: usize,
    pub max_file_size: usize,
    pub max_text_length: usize,
}

impl Default for PipelineGuardrails {
    fn default() -> Self {
        Self {
            stage_timeout_seconds: 120,
            total_timeout_seconds: 600,
            max_llm_calls_per_stage: 5,
            max_total_llm_calls: 20,
            max_retries_per_stage: 3,
            max_evidence_per_field: 10,
            max_audit_entries: 500,
            max_file_size: 50 * 1024 * 1024,
            max_text_length: 500_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardrailViolation {
    pub violation_type: &'static str,
    pub message: String,
    pub severity: ViolationSeverity,
    pub value: i64,
    pub limit: i64,
    pub timestamp: DateTime<Utc>,
}

/// Tracks counters against the configured limits and records violations.
#[derive(Debug)]
pub struct GuardrailChecker {
    guardrails: PipelineGuardrails,
    violations: Vec<GuardrailViolation>,
    llm_calls_by_stage: HashMap<String, u32>,
    total_llm_calls: u32,
    retries_by_stage: HashMap<String, u32>,
}

impl GuardrailChecker {
    pub fn new(guardrails: PipelineGuardrails) -> Self {
        Self {
            guardrails,
            violations: Vec::new(),
            llm_calls_by_stage: HashMap::new(),
            total_llm_calls: 0,
            retries_by_stage: HashMap::new(),
        }
    }

    pub fn guardrails(&self) -> &PipelineGuardrails {
        &self.guardrails
    }

    pub fn check_stage_timeout(&mut self, started_at: DateTime<Utc>) -> bool {
        let elapsed = (Utc::now() - started_at).num_seconds();
        if elapsed >= self.guardrails.stage_timeout_seconds {
            self.add_violation(
                "STAGE_TIMEOUT",
                format!("stage exceeded {}s", self.guardrails.stage_timeout_seconds),
                ViolationSeverity::Error,
                elapsed,
                self.guardrails.stage_timeout_seconds,
            );
            return false;
        }
        true
    }

    pub fn check_total_timeout(&mut self, started_at: DateTime<Utc>) -> bool {
        let elapsed = (Utc::now() - started_at).num_seconds();
        if elapsed >= self.guardrails.total_timeout_seconds {
            self.add_violation(
                "TOTAL_TIMEOUT",
                format!("pipeline exceeded {}s", self.guardrails.total_timeout_seconds),
                ViolationSeverity::Critical,
                elapsed,
                self.guardrails.total_timeout_seconds,
            );
            return false;
        }
        true
    }

    /// Must pass before issuing another LLM call in `stage_name`.
    pub fn check_llm_calls(&mut self, stage_name: &str) -> bool {
        let stage_calls = *self.llm_calls_by_stage.get(stage_name).unwrap_or(&0);
        if stage_calls >= self.guardrails.max_llm_calls_per_stage {
            self.add_violation(
                "STAGE_LLM_LIMIT",
                format!("LLM call limit reached in stage {}", stage_name),
                ViolationSeverity::Error,
                stage_calls as i64,
                self.guardrails.max_llm_calls_per_stage as i64,
            );
            return false;
        }

        if self.total_llm_calls >= self.guardrails.max_total_llm_calls {
            self.add_violation(
                "TOTAL_LLM_LIMIT",
                "total LLM call limit reached".to_string(),
                ViolationSeverity::Critical,
                self.total_llm_calls as i64,
                self.guardrails.max_total_llm_calls as i64,
            );
            return false;
        }

        true
    }

    pub fn record_llm_call(&mut self, stage_name: &str) {
        *self.llm_calls_by_stage.entry(stage_name.to_string()).or_insert(0) += 1;
        self.total_llm_calls += 1;
    }

    pub fn check_retry_limit(&mut self, stage_name: &str) -> bool {
        let retries = *self.retries_by_stage.get(stage_name).unwrap_or(&0);
        if retries >= self.guardrails.max_retries_per_stage {
            self.add_violation(
                "RETRY_LIMIT",
                format!("retry limit reached in stage {}", stage_name),
                ViolationSeverity::Error,
                retries as i64,
                self.guardrails.max_retries_per_stage as i64,
            );
            return false;
        }
        true
    }

    pub fn record_retry(&mut self, stage_name: &str) {
        *self.retries_by_stage.entry(stage_name.to_string()).or_insert(0) += 1;
    }

    pub fn check_file_size(&mut self, size: usize) -> bool {
        if size > self.guardrails.max_file_size {
            self.add_violation(
                "FILE_SIZE",
                format!("file size {} exceeds limit", size),
                ViolationSeverity::Error,
                size as i64,
                self.guardrails.max_file_size as i64,
            );
            return false;
        }
        true
    }

    pub fn check_text_length(&mut self, length: usize) -> bool {
        if length > self.guardrails.max_text_length {
            self.add_violation(
                "TEXT_LENGTH",
                format!("text length {} exceeds limit", length),
                ViolationSeverity::Warning,
                length as i64,
                self.guardrails.max_text_length as i64,
            );
            return false;
        }
        true
    }

    fn add_violation(
        &mut self,
        violation_type: &'static str,
        message: String,
        severity: ViolationSeverity,
        value: i64,
        limit: i64,
    ) {
        tracing::warn!("[guardrails] {:?}: {}", severity, message);
        self.violations.push(GuardrailViolation {
            violation_type,
            message,
            severity,
            value,
            limit,
            timestamp: Utc::now(),
        });
    }

    pub fn violations(&self) -> &[GuardrailViolation] {
        &self.violations
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn has_critical_violations(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Critical)
    }

    pub fn total_llm_calls(&self) -> u32 {
        self.total_llm_calls
    }

    pub fn llm_calls_by_stage(&self) -> &HashMap<String, u32> {
        &self.llm_calls_by_stage
    }
}

impl Default for GuardrailChecker {
    fn default() -> Self {
        Self::new(PipelineGuardrails::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_llm_call_limits() {
        let mut checker = GuardrailChecker::default();

        for _ in 0..5 {
            assert!(checker.check_llm_calls("analysis"));
            checker.record_llm_call("analysis");
        }
        // sixth call in the same stage is refused
        assert!(!checker.check_llm_calls("analysis"));
        assert!(checker.has_violations());

        // another stage still has budget
        assert!(checker.check_llm_calls("validation"));
    }

    #[test]
    fn test_total_llm_limit() {
        let limits = PipelineGuardrails { max_llm_calls_per_stage: 100, ..Default::default() };
        let mut checker = GuardrailChecker::new(limits);

        for _ in 0..20 {
            checker.record_llm_call("analysis");
        }
        assert!(!checker.check_llm_calls("validation"));
        assert!(checker.has_critical_violations());
    }

    #[test]
    fn test_retry_limit() {
        let mut checker = GuardrailChecker::default();
        for _ in 0..3 {
            assert!(checker.check_retry_limit("embedding"));
            checker.record_retry("embedding");
        }
        assert!(!checker.check_retry_limit("embedding"));
    }

    #[test]
    fn test_total_timeout() {
        let mut checker = GuardrailChecker::default();
        let long_ago = Utc::now() - Duration::seconds(601);
        assert!(!checker.check_total_timeout(long_ago));
        assert!(checker.has_critical_violations());

        let mut fresh = GuardrailChecker::default();
        assert!(fresh.check_total_timeout(Utc::now()));
    }

    #[test]
    fn test_size_checks() {
        let mut checker = GuardrailChecker::default();
        assert!(checker.check_file_size(1024));
        assert!(!checker.check_file_size(51 * 1024 * 1024));
        assert!(checker.check_text_length(1000));
        assert!(!checker.check_text_length(500_001));
    }

    #[test]
    fn test_llm_call_accounting_matches_per_stage_sum() {
        let mut checker = GuardrailChecker::default();
        checker.record_llm_call("analysis");
        checker.record_llm_call("analysis");
        checker.record_llm_call("validation");

        let per_stage: u32 = checker.llm_calls_by_stage().values().sum();
        assert_eq!(per_stage, checker.total_llm_calls());
    }
}
