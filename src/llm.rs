//! Chat-completion client shared by summary extraction and reranking.
//!
//! One thin wrapper over an OpenAI-compatible `POST /v1/chat/completions`
//! endpoint. The client performs a single attempt and classifies failures;
//! retry policy belongs to the callers (extraction retries with exponential
//! backoff, reranking fails soft per batch).

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};

/// Status codes worth retrying: rate limit and transient server errors.
const RETRY_STATUS_CODES: [u16; 4] = [429, 500, 503, 504];

/// Single-call failure classification.
#[derive(Debug)]
pub enum LlmError {
    /// No provider configured.
    Disabled,
    /// Rate limit, transient server error, or network failure.
    Transient(String),
    /// Non-retryable API failure.
    Api(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Disabled => write!(f, "LLM provider is disabled"),
            LlmError::Transient(msg) => write!(f, "transient LLM error: {}", msg),
            LlmError::Api(msg) => write!(f, "LLM error: {}", msg),
        }
    }
}

/// Client for the configured judge/extraction model.
pub struct LlmClient {
    enabled: bool,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Internal(e.to_string()))?;

        Ok(Self {
            enabled: config.is_enabled(),
            model: config.model.clone().unwrap_or_default(),
            endpoint: config
                .endpoint_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            client,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run one completion expected to produce JSON. Returns the raw message
    /// content; the caller parses and validates it.
    pub async fn generate_json(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> std::result::Result<String, LlmError> {
        if !self.enabled {
            return Err(LlmError::Disabled);
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Api("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "response_format": {"type": "json_object"},
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let message = format!("API error {}: {}", status, body_text);
            if RETRY_STATUS_CODES.contains(&status.as_u16()) {
                return Err(LlmError::Transient(message));
            }
            return Err(LlmError::Api(message));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Api("completion response missing content".to_string()))
    }
}
