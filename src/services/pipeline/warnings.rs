//! Warning collection for a single pipeline run.
//!
//! Warnings are appended in completion order and filtered by user
//! visibility before they leave the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable warning codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningCode {
    LowConfidence,
    PiiDetected,
    ParsingIssue,
    LlmDisagreement,
    MismatchResolved,
    Mismatch,
    MissingRequired,
    HallucinationDetected,
    ValidationFailed,
    TimeoutWarning,
    RetryOccurred,
    DataIncomplete,
    EmbeddingFailed,
    Truncation,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::PiiDetected => "PII_DETECTED",
            Self::ParsingIssue => "PARSING_ISSUE",
            Self::LlmDisagreement => "LLM_DISAGREEMENT",
            Self::MismatchResolved => "MISMATCH_RESOLVED",
            Self::Mismatch => "MISMATCH",
            Self::MissingRequired => "MISSING_REQUIRED",
            Self::HallucinationDetected => "HALLUCINATION_DETECTED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::TimeoutWarning => "TIMEOUT_WARNING",
            Self::RetryOccurred => "RETRY_OCCURRED",
            Self::DataIncomplete => "DATA_INCOMPLETE",
            Self::EmbeddingFailed => "EMBEDDING_FAILED",
            Self::Truncation => "TRUNCATION",
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            Self::LowConfidence => "신뢰도가 낮습니다",
            Self::PiiDetected => "개인정보가 감지되었습니다",
            Self::ParsingIssue => "파싱 중 문제가 발생했습니다",
            Self::LlmDisagreement => "AI 모델 간 의견 차이가 있습니다",
            Self::MismatchResolved => "AI 모델 간 의견 차이를 다수결로 해결했습니다",
            Self::Mismatch => "AI 모델 간 의견이 일치하지 않습니다",
            Self::MissingRequired => "필수 정보가 누락되었습니다",
            Self::HallucinationDetected => "정보 검증에 실패했습니다",
            Self::ValidationFailed => "데이터 검증에 실패했습니다",
            Self::TimeoutWarning => "처리 시간이 길어지고 있습니다",
            Self::RetryOccurred => "재시도가 발생했습니다",
            Self::DataIncomplete => "일부 데이터가 불완전합니다",
            Self::EmbeddingFailed => "일부 검색 인덱스 생성에 실패했습니다",
            Self::Truncation => "원본 텍스트 일부가 검색 인덱스에서 제외되었습니다",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
}

impl WarningSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineWarning {
    pub code: WarningCode,
    pub message: String,
    pub severity: WarningSeverity,
    pub field_name: Option<String>,
    pub stage_name: Option<String>,
    pub user_visible: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct WarningCollector {
    warnings: Vec<PipelineWarning>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        code: WarningCode,
        message: impl Into<String>,
        severity: WarningSeverity,
    ) -> &PipelineWarning {
        self.push(PipelineWarning {
            code,
            message: message.into(),
            severity,
            field_name: None,
            stage_name: None,
            user_visible: true,
            timestamp: Utc::now(),
        })
    }

    pub fn add_for_field(
        &mut self,
        code: WarningCode,
        field_name: impl Into<String>,
        message: impl Into<String>,
        severity: WarningSeverity,
    ) -> &PipelineWarning {
        self.push(PipelineWarning {
            code,
            message: message.into(),
            severity,
            field_name: Some(field_name.into()),
            stage_name: None,
            user_visible: true,
            timestamp: Utc::now(),
        })
    }

    /// Internal diagnostics that should not reach end users.
    pub fn add_internal(
        &mut self,
        code: WarningCode,
        stage_name: impl Into<String>,
        message: impl Into<String>,
    ) -> &PipelineWarning {
        self.push(PipelineWarning {
            code,
            message: message.into(),
            severity: WarningSeverity::Warning,
            field_name: None,
            stage_name: Some(stage_name.into()),
            user_visible: false,
            timestamp: Utc::now(),
        })
    }

    pub fn add_low_confidence(&mut self, field_name: &str, confidence: f64) {
        let message = format!(
            "'{}' 필드의 신뢰도가 낮습니다 ({}%)",
            field_name,
            (confidence * 100.0) as i64
        );
        self.add_for_field(WarningCode::LowConfidence, field_name, message, WarningSeverity::Warning);
    }

    pub fn add_llm_disagreement(&mut self, field_name: &str) {
        let message = format!("'{}' 필드에서 AI 모델 간 의견 차이가 발생했습니다", field_name);
        self.add_for_field(WarningCode::LlmDisagreement, field_name, message, WarningSeverity::Info);
    }

    pub fn add_hallucination(&mut self, field_name: &str) {
        let message = format!("'{}' 필드의 값이 원본에서 확인되지 않습니다", field_name);
        self.add_for_field(
            WarningCode::HallucinationDetected,
            field_name,
            message,
            WarningSeverity::Warning,
        );
    }

    pub fn add_missing_required(&mut self, field_name: &str) {
        let message = format!("필수 정보 '{}'이(가) 누락되었습니다", field_name);
        self.add_for_field(WarningCode::MissingRequired, field_name, message, WarningSeverity::Error);
    }

    pub fn add_parsing_issue(&mut self, issue: &str) {
        let warning = PipelineWarning {
            code: WarningCode::ParsingIssue,
            message: format!("파싱 중 문제 발생: {}", issue),
            severity: WarningSeverity::Warning,
            field_name: None,
            stage_name: Some("parsing".to_string()),
            user_visible: true,
            timestamp: Utc::now(),
        };
        self.push(warning);
    }

    pub fn add_default(&mut self, code: WarningCode, severity: WarningSeverity) {
        self.add(code, code.default_message(), severity);
    }

    fn push(&mut self, warning: PipelineWarning) -> &PipelineWarning {
        match warning.severity {
            WarningSeverity::Error => {
                tracing::error!("[warnings] {}: {}", warning.code.as_str(), warning.message)
            },
            WarningSeverity::Warning => {
                tracing::warn!("[warnings] {}: {}", warning.code.as_str(), warning.message)
            },
            WarningSeverity::Info => {
                tracing::info!("[warnings] {}: {}", warning.code.as_str(), warning.message)
            },
        }
        self.warnings.push(warning);
        self.warnings.last().expect("just pushed")
    }

    pub fn all(&self) -> &[PipelineWarning] {
        &self.warnings
    }

    pub fn user_visible(&self) -> Vec<&PipelineWarning> {
        self.warnings.iter().filter(|w| w.user_visible).collect()
    }

    pub fn by_code(&self, code: WarningCode) -> Vec<&PipelineWarning> {
        self.warnings.iter().filter(|w| w.code == code).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.warnings.iter().any(|w| w.severity == WarningSeverity::Error)
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_visibility_filter() {
        let mut collector = WarningCollector::new();
        collector.add(WarningCode::LowConfidence, "low", WarningSeverity::Warning);
        collector.add_internal(WarningCode::ValidationFailed, "validation", "llm check errored");

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.user_visible().len(), 1);
    }

    #[test]
    fn test_has_errors() {
        let mut collector = WarningCollector::new();
        collector.add_llm_disagreement("phone");
        assert!(!collector.has_errors());

        collector.add_missing_required("name");
        assert!(collector.has_errors());
    }

    #[test]
    fn test_by_code() {
        let mut collector = WarningCollector::new();
        collector.add_for_field(WarningCode::Mismatch, "phone", "values differ", WarningSeverity::Warning);
        collector.add_llm_disagreement("email");

        let mismatches = collector.by_code(WarningCode::Mismatch);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].field_name.as_deref(), Some("phone"));
    }
}
