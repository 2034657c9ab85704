//! Multi-provider LLM subsystem.
//!
//! One contract across providers (`call_structured`), exponential back-off
//! retries with a retryable-error classifier, and a three-stage JSON
//! repair path for providers without server-side schema enforcement.

pub mod client;
pub mod json_repair;
pub mod models;
pub mod retry;

pub use client::LlmClient;
pub use models::{ChatMessage, LlmError, LlmProvider, LlmResponse, TokenUsage};
pub use retry::{BackoffPolicy, call_with_retry, is_retryable};
