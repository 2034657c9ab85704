//! LLM data models: providers, chat messages, responses and usage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported LLM providers, one contract across all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Openai,
    Gemini,
    Claude,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of a single provider call. Errors are carried as data rather
/// than bubbled as `Err` so a fan-out gather always yields one response
/// per provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub provider: LlmProvider,
    /// Parsed JSON payload when the call and repair succeeded
    pub content: Option<Value>,
    pub raw_text: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.content.is_some()
    }

    pub fn failure(provider: LlmProvider, model: &str, error: impl Into<String>) -> Self {
        Self {
            provider,
            content: None,
            raw_text: String::new(),
            model: model.to_string(),
            usage: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{0} API key not configured")]
    NotConfigured(&'static str),
    #[error("request timed out after {0}s (request may still be billed)")]
    Timeout(u64),
    #[error("API error: {0}")]
    Api(String),
    #[error("JSON parse error: {0}")]
    Parse(String),
}
