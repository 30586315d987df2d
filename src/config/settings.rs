//! Application settings and configuration types.
//!
//! Settings are persisted to `~/.config/mailsift/settings.json` (or the
//! platform equivalent) and loaded once per run. Every section has defaults,
//! so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DEFAULT_MARKER_PREFIX;
use crate::providers::ai::{GenerationParams, OLLAMA_DEFAULT_URL};
use crate::providers::retry::RetryPolicy;

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Could not determine a configuration directory")]
    NoConfigDir,
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Local model configuration.
    pub ai: AiSettings,
    /// Backoff for model and mailbox calls.
    pub retry: RetrySettings,
    /// Decision pass configuration.
    pub decide: DecideSettings,
    /// Remote mailbox sync configuration.
    pub sync: SyncSettings,
    /// File locations.
    pub paths: PathSettings,
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("settings.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let settings: Settings = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    fn validate(&self) -> Result<()> {
        if self.ai.model.trim().is_empty() {
            return Err(ConfigError::Invalid("ai.model must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.ai.min_confidence_delete) {
            return Err(ConfigError::Invalid(format!(
                "ai.min_confidence_delete must be within [0, 1], got {}",
                self.ai.min_confidence_delete
            )));
        }
        if self.sync.marker_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("sync.marker_prefix must not be empty".to_string()));
        }
        if self.decide.cycle.trim().is_empty() {
            return Err(ConfigError::Invalid("decide.cycle must not be empty".to_string()));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "mailsift", "mailsift")
}

/// Local model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Ollama server URL.
    pub base_url: String,
    /// Model name as known to the server.
    pub model: String,
    pub temperature: f32,
    /// Maximum tokens generated per message.
    pub max_tokens: usize,
    /// Context window requested from the server.
    pub context_window: usize,
    /// Body characters included in the prompt.
    pub clip_chars: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Model deletes below this confidence are downgraded to archive.
    pub min_confidence_delete: f32,
    /// Load the model once before the first message.
    pub warm_up: bool,
}

impl AiSettings {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            context_window: self.context_window,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            base_url: OLLAMA_DEFAULT_URL.to_string(),
            model: "mistral".to_string(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            context_window: params.context_window,
            clip_chars: 1500,
            timeout_secs: 45,
            min_confidence_delete: 0.0,
            warm_up: true,
        }
    }
}

/// Retry configuration shared by model and mailbox calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 3_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Decision pass configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecideSettings {
    /// Cycle identifier stamped on new decisions.
    pub cycle: String,
}

impl Default for DecideSettings {
    fn default() -> Self {
        Self {
            cycle: "default".to_string(),
        }
    }
}

/// Remote mailbox sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Remove archived messages from the inbox.
    pub archive: bool,
    /// Prefix of the disposition marker labels.
    pub marker_prefix: String,
    /// Keychain account name of the Gmail credentials.
    pub gmail_account: String,
    /// Messages per run when `--limit` is not given.
    pub default_limit: Option<usize>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            archive: true,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            gmail_account: "me".to_string(),
            default_limit: None,
        }
    }
}

/// File locations. Unset paths resolve under the platform data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub database: Option<PathBuf>,
    /// Override rules file (JSON array).
    pub rules: Option<PathBuf>,
    /// Append-only audit log (JSON Lines).
    pub audit_log: Option<PathBuf>,
}

impl PathSettings {
    pub fn database_path(&self) -> Result<PathBuf> {
        self.resolve(&self.database, "mailsift.db")
    }

    pub fn rules_path(&self) -> Result<PathBuf> {
        match &self.rules {
            Some(path) => Ok(path.clone()),
            None => project_dirs()
                .map(|dirs| dirs.config_dir().join("rules.json"))
                .ok_or(ConfigError::NoConfigDir),
        }
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        self.resolve(&self.audit_log, "audit.jsonl")
    }

    fn resolve(&self, configured: &Option<PathBuf>, file_name: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join(file_name))
                .ok_or(ConfigError::NoConfigDir),
        }
    }
}
