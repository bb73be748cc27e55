//! Prompt assembly - turns a conversation history and system prompt into
//! the role-tagged message list the runtime consumes

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Build the ordered message list for an inference call: the system prompt
/// first (when non-empty), then the history in conversation order.
pub fn assemble(history: &[ChatMessage], system_prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.extend_from_slice(history);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_first() {
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("what's up?"),
        ];
        let messages = assemble(&history, "You are helpful.");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You are helpful.");
        assert_eq!(messages[1..], history[..]);
    }

    #[test]
    fn test_empty_system_prompt_skipped() {
        let history = vec![ChatMessage::user("hi")];
        let messages = assemble(&history, "");
        assert_eq!(messages, history);
    }
}
