//! LLM integration — minimal chat-completions client for field extraction.
//!
//! The extraction engine needs exactly one capability: send a system+user
//! prompt, get text back. `LlmProvider` is that seam; `HttpLlmProvider`
//! implements it against any OpenAI-compatible `/chat/completions` endpoint
//! (OpenAI, a local gateway, a proxy — the pipeline does not care which).

mod http_provider;

pub use http_provider::HttpLlmProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LlmError;

/// Default per-call timeout. Extraction must never hang the orchestrator.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A single chat message on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
}

/// Provider seam — implemented by `HttpLlmProvider` and by test stubs.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Run a single completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EXTRACTOR_API_KEY` is not set (LLM pass disabled).
    ///
    /// - `EXTRACTOR_API_KEY` — required
    /// - `EXTRACTOR_BASE_URL` (default "https://api.openai.com/v1")
    /// - `EXTRACTOR_MODEL` (default "gpt-4o-mini")
    /// - `EXTRACTOR_TIMEOUT_SECS` (default 30)
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("EXTRACTOR_API_KEY").ok()?;

        let base_url = std::env::var("EXTRACTOR_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            std::env::var("EXTRACTOR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout_secs: u64 = std::env::var("EXTRACTOR_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Some(Self {
            base_url,
            api_key: secrecy::SecretString::from(api_key),
            model,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = HttpLlmProvider::new(config)?;
    tracing::info!(model = %config.model, "Using chat-completions extractor backend");
    Ok(Arc::new(provider))
}
