//! Configuration loading and validation.
//!
//! JSON5 format. Config location: `~/.waypoint/waypoint.json`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Sandboxed step executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Checkpoint validator settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Self-correction controller settings.
    #[serde(default)]
    pub correction: CorrectionConfig,

    /// Streaming task manager settings.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// LLM service settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// History persistence settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON5 or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("waypoint.json")
    }

    /// Get the Waypoint state directory.
    ///
    /// Uses `WAYPOINT_STATE_DIR` env var if set, otherwise `~/.waypoint`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("WAYPOINT_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".waypoint")
        } else {
            PathBuf::from(".waypoint")
        }
    }

    /// Path of the history database.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.history
            .path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("history"))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "executor.timeoutMs cannot be 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.checkpoint.quality_threshold) {
            return Err(ConfigError::Validation(format!(
                "checkpoint.qualityThreshold must be within 0..=1, got {}",
                self.checkpoint.quality_threshold
            )));
        }

        if self.streaming.max_concurrent_tasks == 0 {
            return Err(ConfigError::Validation(
                "streaming.maxConcurrentTasks cannot be 0".to_string(),
            ));
        }

        if self.streaming.result_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "streaming.resultBufferSize cannot be 0".to_string(),
            ));
        }

        if self.streaming.task_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "streaming.taskTimeoutMs cannot be 0".to_string(),
            ));
        }

        if self.llm.model.is_empty() {
            return Err(ConfigError::Validation("llm.model is empty".to_string()));
        }

        Ok(())
    }
}

/// Sandboxed step executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Per-step timeout in milliseconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,

    /// Retries for transient failures.
    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Run structural result validators.
    #[serde(default = "default_true")]
    pub enable_validation: bool,

    /// Snapshot files before mutating steps.
    #[serde(default = "default_true")]
    pub enable_snapshot: bool,

    /// Where snapshot backups are kept (a temp dir when unset).
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_step_timeout(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            enable_validation: true,
            enable_snapshot: true,
            snapshot_dir: None,
        }
    }
}

const fn default_step_timeout() -> u64 {
    30_000
}

const fn default_retries() -> u32 {
    3
}

const fn default_retry_delay() -> u64 {
    1_000
}

const fn default_true() -> bool {
    true
}

/// Checkpoint validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Validate each step result before advancing.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Treat every rule as critical.
    #[serde(default)]
    pub strict: bool,

    /// Allow LLM quality scoring for generative capabilities.
    #[serde(default = "default_true")]
    pub quality_check: bool,

    /// Minimum acceptable quality score.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            quality_check: true,
            quality_threshold: default_quality_threshold(),
        }
    }
}

const fn default_quality_threshold() -> f64 {
    0.7
}

/// Self-correction controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionConfig {
    /// Maximum whole-plan execution attempts.
    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Ask the LLM when no pattern or strategy matches.
    #[serde(default = "default_true")]
    pub llm_fallback: bool,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retries(),
            llm_fallback: true,
        }
    }
}

/// Streaming task manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Maximum tasks pending or running at once.
    #[serde(default = "default_max_tasks")]
    pub max_concurrent_tasks: usize,

    /// Minimum interval between progress emissions.
    #[serde(default = "default_throttle")]
    pub throttle_ms: u64,

    /// Partial results kept per task.
    #[serde(default = "default_result_buffer")]
    pub result_buffer_size: usize,

    /// Wall-clock limit for a whole task.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,

    /// Broadcast channel capacity per task.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_tasks(),
            throttle_ms: default_throttle(),
            result_buffer_size: default_result_buffer(),
            task_timeout_ms: default_task_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

const fn default_max_tasks() -> usize {
    10
}

const fn default_throttle() -> u64 {
    100
}

const fn default_result_buffer() -> usize {
    100
}

const fn default_task_timeout() -> u64 {
    600_000
}

const fn default_event_capacity() -> usize {
    256
}

/// LLM service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key (prefer the `WAYPOINT_LLM_API_KEY` env var).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in a response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

const fn default_temperature() -> f32 {
    0.2
}

const fn default_max_tokens() -> u32 {
    2048
}

/// History persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Record validations, corrections and streaming events.
    #[serde(default)]
    pub enabled: bool,

    /// Database directory (defaults to `<state dir>/history`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}
