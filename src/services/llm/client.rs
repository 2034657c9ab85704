//! LLM Client - HTTP client for the three supported providers.
//!
//! One contract across providers: messages + JSON schema in, parsed JSON +
//! token usage out. Only OpenAI enforces the schema server-side; for the
//! others the schema is embedded in the system prompt and the response is
//! repaired (strict parse, fenced block, balanced-brace span).

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use super::json_repair::extract_json;
use super::models::{ChatMessage, LlmProvider, LlmResponse, TokenUsage};
use super::retry::{BackoffPolicy, call_with_retry};
use crate::config::LlmConfig;

pub struct LlmClient {
    http_client: Client,
    config: LlmConfig,
}

impl LlmClient {
    /// The client shares the process-wide HTTP pool.
    pub fn new(http_client: Client, config: LlmConfig) -> Self {
        Self { http_client, config }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.config.max_retries,
            base_delay_secs: self.config.base_delay_secs,
            max_delay_secs: self.config.max_delay_secs,
        }
    }

    /// Providers with a configured API key.
    pub fn available_providers(&self) -> Vec<LlmProvider> {
        let mut providers = Vec::new();
        if !self.config.openai_api_key.is_empty() {
            providers.push(LlmProvider::Openai);
        }
        if !self.config.gemini_api_key.is_empty() {
            providers.push(LlmProvider::Gemini);
        }
        if !self.config.anthropic_api_key.is_empty() {
            providers.push(LlmProvider::Claude);
        }
        providers
    }

    pub fn model_for(&self, provider: LlmProvider) -> &str {
        match provider {
            LlmProvider::Openai => &self.config.openai_model,
            LlmProvider::Gemini => &self.config.gemini_model,
            LlmProvider::Claude => &self.config.anthropic_model,
        }
    }

    /// Structured-output call with the standard retry policy applied.
    pub async fn call_structured(
        &self,
        provider: LlmProvider,
        messages: &[ChatMessage],
        json_schema: &Value,
        temperature: f64,
        max_tokens: u32,
    ) -> LlmResponse {
        call_with_retry(provider.as_str(), self.backoff_policy(), |_| {
            self.call_once(provider, messages, json_schema, temperature, max_tokens)
        })
        .await
    }

    async fn call_once(
        &self,
        provider: LlmProvider,
        messages: &[ChatMessage],
        json_schema: &Value,
        temperature: f64,
        max_tokens: u32,
    ) -> LlmResponse {
        match provider {
            LlmProvider::Openai => {
                self.call_openai(messages, json_schema, temperature, max_tokens).await
            },
            LlmProvider::Gemini => {
                self.call_gemini(messages, json_schema, temperature, max_tokens).await
            },
            LlmProvider::Claude => {
                self.call_claude(messages, json_schema, temperature, max_tokens).await
            },
        }
    }

    // ========================================================================
    // OpenAI: server-side schema enforcement
    // ========================================================================

    async fn call_openai(
        &self,
        messages: &[ChatMessage],
        json_schema: &Value,
        temperature: f64,
        max_tokens: u32,
    ) -> LlmResponse {
        let provider = LlmProvider::Openai;
        let model = self.config.openai_model.clone();
        if self.config.openai_api_key.is_empty() {
            return LlmResponse::failure(provider, &model, "OpenAI API key not configured");
        }

        let request = ChatCompletionRequest {
            model: model.clone(),
            messages: messages.to_vec(),
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
            response_format: Some(json!({
                "type": "json_schema",
                "json_schema": json_schema,
            })),
        };

        let url = format!("{}/chat/completions", self.config.openai_base_url.trim_end_matches('/'));
        tracing::debug!("Calling OpenAI: {} with model {}", url, model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.openai_api_key))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return self.transport_failure(provider, &model, e),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return LlmResponse::failure(provider, &model, format!("API error {}: {}", status, body));
        }

        let parsed: ChatCompletionResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return LlmResponse::failure(provider, &model, format!("JSON parse error: {}", e))
            },
        };

        let raw_text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if raw_text.is_empty() {
            return LlmResponse::failure(provider, &model, "Empty response from provider");
        }

        let content = match serde_json::from_str::<Value>(&raw_text) {
            Ok(v) => Some(v),
            Err(e) => {
                return LlmResponse {
                    provider,
                    content: None,
                    raw_text,
                    model,
                    usage: None,
                    error: Some(format!("JSON parse error: {}", e)),
                }
            },
        };

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens),
        });

        LlmResponse { provider, content, raw_text, model, usage, error: None }
    }

    // ========================================================================
    // Gemini: JSON mime type, schema embedded in the prompt
    // ========================================================================

    async fn call_gemini(
        &self,
        messages: &[ChatMessage],
        json_schema: &Value,
        temperature: f64,
        max_tokens: u32,
    ) -> LlmResponse {
        let provider = LlmProvider::Gemini;
        let model = self.config.gemini_model.clone();
        if self.config.gemini_api_key.is_empty() {
            return LlmResponse::failure(provider, &model, "Gemini API key not configured");
        }

        let prompt = flatten_messages(messages, Some(json_schema));
        let request = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
                "responseMimeType": "application/json",
            }
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.gemini_base_url.trim_end_matches('/'),
            model,
            self.config.gemini_api_key
        );

        let response = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return self.transport_failure(provider, &model, e),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return LlmResponse::failure(provider, &model, format!("API error {}: {}", status, body));
        }

        let parsed: GeminiResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return LlmResponse::failure(provider, &model, format!("JSON parse error: {}", e))
            },
        };

        let raw_text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default();
        if raw_text.is_empty() {
            return LlmResponse::failure(provider, &model, "Empty response from provider");
        }

        let content = extract_json(&raw_text);
        let error = if content.is_none() {
            Some("JSON parse error: no valid object in response".to_string())
        } else {
            None
        };

        let usage = parsed.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });

        LlmResponse { provider, content, raw_text, model, usage, error }
    }

    // ========================================================================
    // Claude: schema embedded in the system prompt, response repaired
    // ========================================================================

    async fn call_claude(
        &self,
        messages: &[ChatMessage],
        json_schema: &Value,
        temperature: f64,
        max_tokens: u32,
    ) -> LlmResponse {
        let provider = LlmProvider::Claude;
        let model = self.config.anthropic_model.clone();
        if self.config.anthropic_api_key.is_empty() {
            return LlmResponse::failure(provider, &model, "Anthropic API key not configured");
        }

        let mut system = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        system.push_str(&format!(
            "\n\nRespond with a single JSON object matching this schema:\n{}",
            json_schema
        ));

        let user_messages: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let request = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "system": system,
            "messages": user_messages,
        });

        let url = format!("{}/messages", self.config.anthropic_base_url.trim_end_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &self.config.anthropic_api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return self.transport_failure(provider, &model, e),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return LlmResponse::failure(provider, &model, format!("API error {}: {}", status, body));
        }

        let parsed: ClaudeResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return LlmResponse::failure(provider, &model, format!("JSON parse error: {}", e))
            },
        };

        let raw_text = parsed.content.first().map(|c| c.text.clone()).unwrap_or_default();
        if raw_text.is_empty() {
            return LlmResponse::failure(provider, &model, "Empty response from provider");
        }

        let content = extract_json(&raw_text);
        let error = if content.is_none() {
            Some("JSON parse error: no valid object in response".to_string())
        } else {
            None
        };

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });

        LlmResponse { provider, content, raw_text, model, usage, error }
    }

    /// Map a transport error to a response. Timeouts are flagged with the
    /// billing caveat: the upstream may have done the work even though the
    /// response was discarded.
    fn transport_failure(
        &self,
        provider: LlmProvider,
        model: &str,
        error: reqwest::Error,
    ) -> LlmResponse {
        if error.is_timeout() {
            tracing::error!(
                "[llm] {} timeout after {}s - the upstream request may have been billed \
                 even though the response was discarded",
                provider.as_str(),
                self.config.timeout_secs
            );
            LlmResponse::failure(
                provider,
                model,
                format!(
                    "timeout after {}s (request may still be billed)",
                    self.config.timeout_secs
                ),
            )
        } else if error.is_connect() {
            LlmResponse::failure(provider, model, format!("connection failed: {}", error))
        } else {
            LlmResponse::failure(provider, model, format!("network error: {}", error))
        }
    }
}

/// Flatten chat messages into one prompt (Gemini has no role array in this
/// call shape), appending the expected schema.
fn flatten_messages(messages: &[ChatMessage], json_schema: Option<&Value>) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .map(|m| match m.role {
            "system" => format!("System: {}", m.content),
            "assistant" => format!("Assistant: {}", m.content),
            _ => format!("User: {}", m.content),
        })
        .collect();

    if let Some(schema) = json_schema {
        parts.push(format!("Respond with a single JSON object matching this schema:\n{}", schema));
    }

    parts.join("\n\n")
}

// ============================================================================
// Provider wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    #[serde(default)]
    content: Vec<ClaudeContent>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn client_with_keys(openai: &str, gemini: &str, claude: &str) -> LlmClient {
        let config = LlmConfig {
            openai_api_key: openai.to_string(),
            gemini_api_key: gemini.to_string(),
            anthropic_api_key: claude.to_string(),
            ..Default::default()
        };
        LlmClient::new(Client::new(), config)
    }

    #[test]
    fn test_available_providers() {
        let client = client_with_keys("sk-test", "", "key");
        assert_eq!(
            client.available_providers(),
            vec![LlmProvider::Openai, LlmProvider::Claude]
        );

        let none = client_with_keys("", "", "");
        assert!(none.available_providers().is_empty());
    }

    #[test]
    fn test_flatten_messages_embeds_schema() {
        let messages = vec![
            ChatMessage::system("You are a parser."),
            ChatMessage::user("Extract from this resume."),
        ];
        let schema = json!({"type": "object"});
        let prompt = flatten_messages(&messages, Some(&schema));

        assert!(prompt.starts_with("System: You are a parser."));
        assert!(prompt.contains("User: Extract from this resume."));
        assert!(prompt.contains(r#""type":"object""#));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_immediately() {
        let client = client_with_keys("", "", "");
        let messages = vec![ChatMessage::user("hi")];
        let response = client
            .call_structured(LlmProvider::Openai, &messages, &json!({}), 0.1, 128)
            .await;
        assert!(!response.success());
        assert!(response.error.as_deref().unwrap().contains("not configured"));
    }
}
