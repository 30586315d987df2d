//! Local language model access.
//!
//! The decision engine only sees the [`GenerationClient`] trait; the
//! [`OllamaClient`] implements it against a local Ollama server.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mailsift::providers::ai::{GenerationClient, GenerationRequest, OllamaClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ollama = OllamaClient::new("http://localhost:11434", Duration::from_secs(45))?;
//! let text = ollama
//!     .generate(&GenerationRequest::new("mistral", "Reply with {\"disposition\": \"keep\"}"))
//!     .await?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

mod ollama;
mod traits;

pub use ollama::{OllamaClient, OLLAMA_DEFAULT_URL};
pub use traits::{
    GenerationClient, GenerationError, GenerationParams, GenerationRequest, GenerationResult,
    DEFAULT_TIMEOUT,
};

#[cfg(test)]
pub use traits::MockGenerationClient;
