//! Ordered message transcript replayed to the reasoning engine.

use serde::{Deserialize, Serialize};

use crate::core::types::{Message, Role};

/// Conversation state for one diagnostic session.
///
/// Append-only; the single exception is [`Transcript::set_final_prompt`],
/// which overwrites a trailing user turn so the engine never sees two user
/// turns in a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Message::assistant(content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages for one engine call: the transcript followed by an ephemeral note
    /// that is not retained.
    pub fn with_note(&self, note: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.extend_from_slice(&self.messages);
        messages.push(Message::user(note));
        messages
    }

    /// Install the forced-finalization prompt as the trailing user turn.
    pub fn set_final_prompt(&mut self, content: impl Into<String>) {
        let content = content.into();
        match self.messages.last_mut() {
            Some(last) if last.role == Role::User => last.content = content,
            _ => self.push_user(content),
        }
    }
}
