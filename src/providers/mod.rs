//! External service clients.
//!
//! - [`ai`] - local language model generation (Ollama)
//! - [`email`] - remote mailbox mutations (Gmail API)
//! - [`retry`] - bounded backoff shared by both

pub mod ai;
pub mod email;
pub mod retry;
