use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm unavailable: {0}")]
    Unavailable(String),
    #[error("llm response invalid: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issues one completion call and returns the raw text of the model's
    /// `response` field. Callers validate the JSON inside it.
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Clone, Debug)]
pub struct HttpLlmConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// Completion client for an Ollama-style endpoint. The client timeout is the
/// analysis soft deadline: when it fires, the analyzer's fail-safe ladder
/// takes over instead of surfacing an error.
#[derive(Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: HttpLlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
        });
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Unavailable(format!(
                "status {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .get("response")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("missing response field".to_string()))
    }
}
