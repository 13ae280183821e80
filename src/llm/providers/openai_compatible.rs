use async_trait::async_trait;

use crate::agent_engine::message::Message;
use crate::errors::{AgentError, AgentResult};
use crate::llm::provider::ModelClient;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};

pub struct OpenAiCompatibleClient {
    id: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(id: String, api_base: String, api_key: String) -> Self {
        Self {
            id,
            endpoint: completions_endpoint(&api_base),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn bearer(&self) -> &str {
        if self.api_key.is_empty() {
            "EMPTY"
        } else {
            &self.api_key
        }
    }
}

/// Accepts either a base URL or the full `/chat/completions` URL.
fn completions_endpoint(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.id
    }

    async fn complete(&self, messages: &[Message], cfg: &CallConfig) -> AgentResult<LlmResponse> {
        let wire: Vec<ChatMessage> = messages.iter().map(ChatMessage::from).collect();
        let body = serde_json::json!({
            "model": cfg.model,
            "messages": &wire,
            "max_tokens": cfg.max_tokens,
            "temperature": cfg.temperature,
            "top_p": cfg.top_p,
            "frequency_penalty": cfg.frequency_penalty,
            "stream": false,
        });

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            messages = wire.len(),
            endpoint = %self.endpoint,
            "sending model request"
        );
        tracing::trace!(body = %sanitized_body(&body), "request body (sanitized, base64 omitted)");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ModelUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let err_body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %err_body, "model request rejected");
            return Err(AgentError::ModelRejected {
                status: status.as_u16(),
                body: err_body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::ModelUnavailable(format!("invalid response body: {e}")))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        tracing::info!(content_len = content.len(), "model response received");
        Ok(LlmResponse { content })
    }
}

/// Clone of the request body with image payloads replaced, for logging only.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|i| i.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}
