use async_trait::async_trait;

use crate::agent_engine::message::Message;
use crate::errors::AgentResult;
use crate::llm::types::{CallConfig, LlmResponse};

/// Request/response chat completion. Implementations must return `Err` for
/// transport or HTTP failures and `Ok` with empty content for a degenerate
/// success, so callers can tell the two apart.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier of this client (matches the config.toml provider key).
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[Message], cfg: &CallConfig) -> AgentResult<LlmResponse>;
}
