use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Image { bytes: Vec<u8>, mime: String },
}

impl Segment {
    pub fn is_image(&self) -> bool {
        matches!(self, Segment::Image { .. })
    }
}

/// One conversation turn. Fields are private so a message cannot change once
/// it has been appended to a context; corrections are new messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    segments: Vec<Segment>,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, segments: Vec<Segment>) -> Self {
        Self {
            role,
            segments,
            created_at: Utc::now(),
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Segment::Text { text: text.into() }])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn has_images(&self) -> bool {
        self.segments.iter().any(Segment::is_image)
    }

    /// Concatenated text segments, newline separated.
    pub fn text_content(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text { text } => Some(text.as_str()),
                Segment::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Copy of this message with image segments removed; text order is kept.
    pub fn without_images(&self) -> Message {
        Message {
            role: self.role,
            segments: self.segments.iter().filter(|s| !s.is_image()).cloned().collect(),
            created_at: self.created_at,
        }
    }
}
