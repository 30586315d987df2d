//! Text generation client trait and supporting types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::retry::Retryable;

/// Errors that can occur while generating text.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Client configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout(err.to_string())
        } else if err.is_decode() {
            GenerationError::InvalidResponse(err.to_string())
        } else {
            GenerationError::Connection(err.to_string())
        }
    }
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout(_) | GenerationError::Connection(_) => true,
            GenerationError::ApiError { status, .. } => *status == 429 || *status >= 500,
            GenerationError::InvalidResponse(_) | GenerationError::Configuration(_) => false,
        }
    }
}

/// Result type for generation operations.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Sampling and sizing parameters forwarded to the model as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    /// Context window size requested from the server.
    pub context_window: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 160,
            context_window: 2048,
        }
    }
}

/// One prompt to run against one model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
    /// Ask the server to constrain output to JSON when it supports it.
    pub json_output: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            params: GenerationParams::default(),
            json_output: true,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// A language model that turns a prompt into raw text.
///
/// Output is untrusted: it may be truncated or malformed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult<String>;

    /// Loads `model` ahead of the first real request. Best effort.
    async fn warm_up(&self, _model: &str) -> GenerationResult<()> {
        Ok(())
    }
}

/// Default request timeout for local model calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(GenerationError::Timeout("t".into()).is_retryable());
        assert!(GenerationError::Connection("refused".into()).is_retryable());
        assert!(GenerationError::ApiError {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!GenerationError::ApiError {
            status: 404,
            message: "model not found".into()
        }
        .is_retryable());
        assert!(!GenerationError::InvalidResponse("bad".into()).is_retryable());
    }

    #[test]
    fn request_builder_defaults() {
        let request = GenerationRequest::new("mistral", "hi");
        assert!(request.json_output);
        assert_eq!(request.params.max_tokens, 160);
    }
}
