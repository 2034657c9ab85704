//! Error taxonomy: stable codes, retryability, and the fixed table of
//! user-facing messages. Raw technical strings never reach users; they are
//! classified here first.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Permanent
    ParseFailed,
    Encrypted,
    ScannedImage,
    TextTooShort,
    InvalidFile,
    UnsupportedType,
    MissingRequiredFields,
    MultiIdentity,
    InsufficientCredits,
    DbSaveFailed,
    RaceCondition,
    // Retryable
    Timeout,
    RateLimit,
    Network,
    StorageError,
    LlmTimeout,
    LlmError,
    // Fallback
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseFailed => "PARSE_FAILED",
            Self::Encrypted => "ENCRYPTED",
            Self::ScannedImage => "SCANNED_IMAGE",
            Self::TextTooShort => "TEXT_TOO_SHORT",
            Self::InvalidFile => "INVALID_FILE",
            Self::UnsupportedType => "UNSUPPORTED_TYPE",
            Self::MissingRequiredFields => "MISSING_REQUIRED_FIELDS",
            Self::MultiIdentity => "MULTI_IDENTITY",
            Self::InsufficientCredits => "INSUFFICIENT_CREDITS",
            Self::DbSaveFailed => "DB_SAVE_FAILED",
            Self::RaceCondition => "RACE_CONDITION",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Network => "NETWORK",
            Self::StorageError => "STORAGE_ERROR",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::LlmError => "LLM_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse_code(s: &str) -> Self {
        match s {
            "PARSE_FAILED" => Self::ParseFailed,
            "ENCRYPTED" | "DRM_PROTECTED" => Self::Encrypted,
            "SCANNED_IMAGE" => Self::ScannedImage,
            "TEXT_TOO_SHORT" => Self::TextTooShort,
            "INVALID_FILE" | "FILE_TOO_LARGE" | "TOO_MANY_PAGES" => Self::InvalidFile,
            "UNSUPPORTED_TYPE" | "UNSUPPORTED_FORMAT" => Self::UnsupportedType,
            "MISSING_REQUIRED_FIELDS" => Self::MissingRequiredFields,
            "MULTI_IDENTITY" => Self::MultiIdentity,
            "INSUFFICIENT_CREDITS" => Self::InsufficientCredits,
            "DB_SAVE_FAILED" => Self::DbSaveFailed,
            "RACE_CONDITION" => Self::RaceCondition,
            "TIMEOUT" => Self::Timeout,
            "RATE_LIMIT" => Self::RateLimit,
            "NETWORK" => Self::Network,
            "STORAGE_ERROR" => Self::StorageError,
            "LLM_TIMEOUT" => Self::LlmTimeout,
            "LLM_ERROR" => Self::LlmError,
            _ => Self::Unknown,
        }
    }

    /// Retryable errors go back to the queue; permanent ones terminate the
    /// job immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::RateLimit
                | Self::Network
                | Self::StorageError
                | Self::LlmTimeout
                | Self::LlmError
        )
    }

    /// Fixed, localized user message. The only strings end users see.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ParseFailed => "파일을 읽을 수 없습니다. 다른 형식으로 저장 후 다시 시도해주세요.",
            Self::Encrypted => "암호화된 파일입니다. 암호를 해제한 후 다시 업로드해주세요.",
            Self::ScannedImage => {
                "스캔 이미지로 된 파일은 분석할 수 없습니다. 텍스트가 포함된 파일을 올려주세요."
            },
            Self::TextTooShort => "문서에서 충분한 텍스트를 찾지 못했습니다.",
            Self::InvalidFile => "처리할 수 없는 파일입니다. 크기와 페이지 수를 확인해주세요.",
            Self::UnsupportedType => "지원하지 않는 파일 형식입니다. (PDF, DOC, DOCX, HWP, HWPX)",
            Self::MissingRequiredFields => "이력서에서 필수 정보를 찾지 못했습니다.",
            Self::MultiIdentity => "여러 사람의 정보가 담긴 파일은 처리할 수 없습니다.",
            Self::InsufficientCredits => "크레딧이 부족합니다. 플랜을 업그레이드해주세요.",
            Self::DbSaveFailed => "저장 중 문제가 발생했습니다. 잠시 후 다시 시도해주세요.",
            Self::RaceCondition => "동시에 처리된 요청이 있습니다. 잠시 후 다시 시도해주세요.",
            Self::Timeout | Self::LlmTimeout => {
                "분석 시간이 초과되었습니다. 잠시 후 다시 시도해주세요."
            },
            Self::RateLimit => "요청이 몰리고 있습니다. 잠시 후 다시 시도해주세요.",
            Self::Network | Self::StorageError => {
                "일시적인 연결 문제가 발생했습니다. 잠시 후 다시 시도해주세요."
            },
            Self::LlmError => "분석 서비스에 일시적인 문제가 있습니다. 잠시 후 다시 시도해주세요.",
            Self::Unknown => "알 수 없는 오류가 발생했습니다. 지원팀에 문의해주세요.",
        }
    }

    /// Classify a raw technical message by substring patterns.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();

        if lower.contains("multi") && lower.contains("identity") {
            Self::MultiIdentity
        } else if lower.contains("insufficient") && lower.contains("credit") {
            Self::InsufficientCredits
        } else if lower.contains("race condition") || lower.contains("already updated") {
            Self::RaceCondition
        } else if lower.contains("encrypted") || lower.contains("drm") || lower.contains("password")
        {
            Self::Encrypted
        } else if lower.contains("scanned") || lower.contains("ocr") {
            Self::ScannedImage
        } else if lower.contains("too short") || lower.contains("text_too_short") {
            Self::TextTooShort
        } else if lower.contains("unsupported") {
            Self::UnsupportedType
        } else if lower.contains("parse") && lower.contains("fail") {
            Self::ParseFailed
        } else if lower.contains("missing") && lower.contains("field") {
            Self::MissingRequiredFields
        } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429")
        {
            Self::RateLimit
        } else if (lower.contains("llm") || lower.contains("model") || lower.contains("provider"))
            && lower.contains("timeout")
        {
            Self::LlmTimeout
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("storage") || lower.contains("download") {
            Self::StorageError
        } else if lower.contains("connection") || lower.contains("network") {
            Self::Network
        } else if lower.contains("constraint") || lower.contains("save") && lower.contains("fail") {
            Self::DbSaveFailed
        } else if lower.contains("overloaded")
            || lower.contains("capacity")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
        {
            Self::LlmError
        } else {
            Self::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_partition() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::RateLimit.is_retryable());
        assert!(ErrorCode::StorageError.is_retryable());
        assert!(ErrorCode::LlmError.is_retryable());

        assert!(!ErrorCode::Encrypted.is_retryable());
        assert!(!ErrorCode::MultiIdentity.is_retryable());
        assert!(!ErrorCode::InsufficientCredits.is_retryable());
        assert!(!ErrorCode::RaceCondition.is_retryable());
        assert!(!ErrorCode::Unknown.is_retryable());
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorCode::classify("multi identity detected: 2 persons"), ErrorCode::MultiIdentity);
        assert_eq!(ErrorCode::classify("file is encrypted"), ErrorCode::Encrypted);
        assert_eq!(ErrorCode::classify("HTTP 429 rate limit"), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::classify("llm request timeout after 120s"), ErrorCode::LlmTimeout);
        assert_eq!(ErrorCode::classify("request timed out"), ErrorCode::Timeout);
        assert_eq!(ErrorCode::classify("storage download failed"), ErrorCode::StorageError);
        assert_eq!(ErrorCode::classify("connection refused"), ErrorCode::Network);
        assert_eq!(ErrorCode::classify("model overloaded"), ErrorCode::LlmError);
        assert_eq!(ErrorCode::classify("something else entirely"), ErrorCode::Unknown);
    }

    #[test]
    fn test_roundtrip_and_messages() {
        for code in [
            ErrorCode::ParseFailed,
            ErrorCode::Encrypted,
            ErrorCode::ScannedImage,
            ErrorCode::TextTooShort,
            ErrorCode::MissingRequiredFields,
            ErrorCode::MultiIdentity,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::parse_code(code.as_str()), code);
            assert!(!code.user_message().is_empty());
        }
    }
}
