use crate::agent_engine::message::{Message, Role};
use crate::errors::{AgentError, AgentResult};

/// Ordered model input window.
///
/// Invariants: at most one system message, always at index 0; trimming never
/// drops it and keeps the remaining messages in their original order.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_system(&self) -> bool {
        self.messages.first().is_some_and(|m| m.role() == Role::System)
    }

    /// Number of messages excluding the system message.
    pub fn conversation_len(&self) -> usize {
        self.messages.len() - usize::from(self.has_system())
    }

    pub fn append(&mut self, message: Message) -> AgentResult<()> {
        if message.role() == Role::System {
            if self.has_system() {
                return Err(AgentError::Context("context already has a system message".into()));
            }
            self.messages.insert(0, message);
        } else {
            self.messages.push(message);
        }
        Ok(())
    }

    /// Keeps the system message (if any) plus the newest `max_len` others.
    pub fn trim(&mut self, max_len: usize) {
        let excess = self.conversation_len().saturating_sub(max_len);
        if excess == 0 {
            return;
        }
        let first = usize::from(self.has_system());
        self.messages.drain(first..first + excess);
        tracing::debug!(dropped = excess, remaining = self.messages.len(), "context trimmed");
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Same context with every image segment removed. Applying it twice is a no-op.
    pub fn strip_images(&self) -> ConversationContext {
        ConversationContext {
            messages: self.messages.iter().map(Message::without_images).collect(),
        }
    }

    /// What gets sent to the model. With `strip_history` set, screenshots of
    /// earlier turns are dropped and only the newest message keeps its images.
    pub fn request_view(&self, strip_history: bool) -> Vec<Message> {
        if !strip_history {
            return self.snapshot();
        }
        let last = self.messages.len().saturating_sub(1);
        self.messages
            .iter()
            .enumerate()
            .map(|(i, m)| if i == last { m.clone() } else { m.without_images() })
            .collect()
    }
}
