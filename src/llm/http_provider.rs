//! HTTP chat-completions provider over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::error::LlmError;
use crate::llm::{CompletionRequest, CompletionResponse, LlmConfig, LlmProvider};

/// Chat-completions client for an OpenAI-compatible endpoint.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: secrecy::SecretString,
    model: String,
    timeout: Duration,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.model.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: self.model.clone(),
                        after: self.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: self.model.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: self.model.clone(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: self.model.clone(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: self.model.clone(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let value: serde_json::Value =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: self.model.clone(),
                reason: format!("response body is not JSON: {e}"),
            })?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.model.clone(),
                reason: "no choices[0].message.content in response".to_string(),
            })?;

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model.clone(),
                reason: "empty completion content".to_string(),
            });
        }

        Ok(CompletionResponse {
            content: content.to_string(),
        })
    }
}
