use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::agent_engine::message::{Message, Segment};

/// Wire format of one chat-completions message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        let parts = message
            .segments()
            .iter()
            .map(|segment| match segment {
                Segment::Text { text } => ContentPart::Text { text: text.clone() },
                Segment::Image { bytes, mime } => ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!(
                            "data:{mime};base64,{}",
                            base64::engine::general_purpose::STANDARD.encode(bytes)
                        ),
                    },
                },
            })
            .collect();
        ChatMessage {
            role: message.role().as_str().to_string(),
            content: MessageContent::Parts(parts),
        }
    }
}

/// Per-call sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub max_tokens: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            model: "autoglm-phone".into(),
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            max_tokens: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
}

impl LlmResponse {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}
