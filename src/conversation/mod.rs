//! Conversation types and transcript storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant", alias = "ai")]
    Agent,
}

/// One turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set while an in-flight stream is still building this message
    #[serde(default)]
    pub pending: bool,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, pending: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            pending,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, false)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content, false)
    }

    /// Empty agent reply awaiting streamed content
    pub fn placeholder() -> Self {
        Self::new(Role::Agent, String::new(), true)
    }
}

/// Ordered, append-only transcript.
///
/// Insertion order is display order. Nothing is ever removed; the only
/// in-place mutations are [`extend_last`](Self::extend_last) and
/// [`replace_last`](Self::replace_last).
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Pre-populate from persisted history
    pub fn with_history(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the last message, returning the one it displaced.
    /// On an empty store this appends.
    pub fn replace_last(&mut self, message: Message) -> Option<Message> {
        match self.messages.last_mut() {
            Some(last) => Some(std::mem::replace(last, message)),
            None => {
                self.messages.push(message);
                None
            }
        }
    }

    /// Append text to the last message's content. Returns false if empty.
    pub fn extend_last(&mut self, delta: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) => {
                last.content.push_str(delta);
                true
            }
            None => false,
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

#[cfg(test)]
impl MessageStore {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.pending).count()
    }
}
