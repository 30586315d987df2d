//! Ollama generation client.
//!
//! Talks to Ollama's native `/api/generate` endpoint with streaming off, so
//! each call returns the complete generated text in one response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{GenerationClient, GenerationError, GenerationRequest, GenerationResult};

/// Default Ollama API URL.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: usize,
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Client for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GenerationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_generate(&self, body: &GenerateRequest<'_>) -> GenerationResult<String> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult<String> {
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            format: request.json_output.then_some("json"),
            options: GenerateOptions {
                temperature: request.params.temperature,
                num_predict: request.params.max_tokens,
                num_ctx: request.params.context_window,
            },
        };

        tracing::debug!(model = %request.model, prompt_chars = request.prompt.len(), "Calling Ollama");
        self.post_generate(&body).await
    }

    /// Loads the model into memory with an empty prompt so the first real
    /// request does not pay the load time inside its timeout.
    async fn warm_up(&self, model: &str) -> GenerationResult<()> {
        let body = GenerateRequest {
            model,
            prompt: "",
            stream: false,
            format: None,
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 1,
                num_ctx: 512,
            },
        };
        self.post_generate(&body).await.map(|_| ())
    }
}
