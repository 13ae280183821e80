use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    /// Base URL; `/chat/completions` is appended when missing.
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional API key stored in config.toml (falls back to env var PHONE_AGENT_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f64 {
    0.0
}

fn default_top_p() -> f64 {
    0.85
}

fn default_frequency_penalty() -> f64 {
    0.2
}

fn default_max_tokens() -> u32 {
    3000
}

/// What to do when a goal arrives while another run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    #[default]
    Reject,
    CancelActive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Maximum number of non-system messages kept in the model context.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    /// Pause after each executed action so the UI can settle before the next capture.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wall-clock budget for one run. `None` means unbounded.
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_viewport_width")]
    pub default_viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub default_viewport_height: u32,
    /// Drop screenshots from every message but the latest before calling the model.
    #[serde(default = "default_true")]
    pub strip_history_images: bool,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

fn default_max_steps() -> u32 {
    50
}

fn default_context_limit() -> usize {
    20
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_viewport_width() -> u32 {
    1080
}

fn default_viewport_height() -> u32 {
    1920
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            context_limit: default_context_limit(),
            settle_delay_ms: default_settle_delay_ms(),
            max_duration_secs: None,
            default_viewport_width: default_viewport_width(),
            default_viewport_height: default_viewport_height(),
            strip_history_images: true,
            busy_policy: BusyPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failed model call. 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionConfig {
    /// Longest side, in pixels, of screenshots sent to the model.
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_max_image_dimension() -> u32 {
    800
}

fn default_jpeg_quality() -> u8 {
    60
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            max_image_dimension: default_max_image_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    /// Replaces the built-in system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Replaces the built-in "continue the task" directive when set.
    #[serde(default)]
    pub continue_directive: Option<String>,
    /// Goal used for image-initiated runs that carry no text.
    #[serde(default)]
    pub image_goal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Overrides the history file location.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
}

fn resolve_config_path() -> AgentResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(AgentError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> AgentResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> AgentResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> AgentResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

impl AppConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.agent.max_steps == 0 {
            return Err(AgentError::Config("agent.max_steps must be at least 1".into()));
        }
        if self.agent.context_limit == 0 {
            return Err(AgentError::Config("agent.context_limit must be at least 1".into()));
        }
        if !(1..=100).contains(&self.perception.jpeg_quality) {
            return Err(AgentError::Config("perception.jpeg_quality must be in 1..=100".into()));
        }
        if self.perception.max_image_dimension == 0 {
            return Err(AgentError::Config(
                "perception.max_image_dimension must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
