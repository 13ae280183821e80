use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Device automation is unavailable; enable the automation service and retry")]
    AutomationUnavailable,

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model request rejected ({status}): {body}")]
    ModelRejected { status: u16, body: String },

    #[error("Model returned an empty response; check the network connection")]
    EmptyResponse,

    #[error("Action execution failed: {0}")]
    ActionExecutionFailed(String),

    #[error("Task took more than {0} steps; try simplifying the task")]
    StepBoundExceeded(u32),

    #[error("Task exceeded its time budget")]
    DeadlineExceeded,

    #[error("Task cancelled")]
    Cancelled,

    #[error("Another task is already running")]
    Busy,

    #[error("Context error: {0}")]
    Context(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Coarse classification of why a task run ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AutomationUnavailable,
    ModelUnavailable,
    EmptyResponse,
    ActionExecutionFailed,
    StepBoundExceeded,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::AutomationUnavailable => FailureKind::AutomationUnavailable,
            AgentError::ModelUnavailable(_)
            | AgentError::ModelRejected { .. }
            | AgentError::Http(_) => FailureKind::ModelUnavailable,
            AgentError::EmptyResponse => FailureKind::EmptyResponse,
            AgentError::ActionExecutionFailed(_) => FailureKind::ActionExecutionFailed,
            AgentError::StepBoundExceeded(_) => FailureKind::StepBoundExceeded,
            AgentError::DeadlineExceeded => FailureKind::DeadlineExceeded,
            AgentError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }

    /// Transient transport failures only. An empty response is a degenerate
    /// success, not a network error, and is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::ModelUnavailable(_) => true,
            AgentError::ModelRejected { status, .. } => *status == 429 || *status >= 500,
            AgentError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Cancellation and deadline expiry unwind to `Aborted` rather than `Failed`.
    pub fn is_abort(&self) -> bool {
        matches!(self, AgentError::Cancelled | AgentError::DeadlineExceeded)
    }
}

impl serde::Serialize for AgentError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
