use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure modes of one model call.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model call timed out")]
    Timeout,

    #[error("model refused the prompt: {0}")]
    Refused(String),

    #[error("model transport error: {0}")]
    Transport(String),
}

/// The external inference service: `invoke(prompt) -> text`.
///
/// Replies are untrusted and non-deterministic. Implementations must be safe
/// to call concurrently.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String, ModelError>;

    fn name(&self) -> &str {
        "model"
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    /// Client with a transport-level timeout in addition to the invoker's.
    pub fn with_timeout(base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url,
            model,
            client,
        })
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        // No forced JSON format: sentinel replies are plain sentences.
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama request failed: {}", response.status());
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(ollama_response.response)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn invoke(&self, prompt: &str) -> Result<String, ModelError> {
        self.generate(prompt).await.map_err(|e| {
            let timed_out = e
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out {
                ModelError::Timeout
            } else {
                ModelError::Transport(format!("{:#}", e))
            }
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
