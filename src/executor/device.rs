use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::types::ParsedAction;
use crate::errors::AgentResult;
use crate::executor::coordinator::Viewport;
use crate::perception::screenshot::Screenshot;

/// Outcome of dispatching one action to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Screen capture, foreground-app query and gesture dispatch on the target
/// device. Implemented by the host (accessibility service, adb bridge, test
/// double) and handed to the orchestrator at construction.
#[async_trait]
pub trait DeviceAutomation: Send + Sync {
    /// False when the automation channel is not connected or not permitted.
    async fn is_available(&self) -> bool;

    /// `Ok(None)` when the platform refuses a capture (secure window, etc.).
    async fn capture_screen(&self) -> AgentResult<Option<Screenshot>>;

    /// Identifier of the app in the foreground, if known.
    async fn foreground_app(&self) -> AgentResult<Option<String>>;

    /// Performs the action. Points are normalized 0–999; `viewport` gives the
    /// pixel size to map them onto (see `executor::coordinator::to_physical`).
    async fn dispatch(&self, action: &ParsedAction, viewport: Viewport) -> AgentResult<StepResult>;
}
