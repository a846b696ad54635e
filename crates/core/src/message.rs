//! Chat message and chat history domain types.
//!
//! These are the value objects exchanged with the completion backend:
//! the caller builds a history, the kernel dispatches it, and the backend
//! replies with content or tool-call requests whose results are appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The role of a message author in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Function (tool) result
    Tool,
}

/// A single message in a chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: String,

    /// Who authored this message
    pub role: ChatRole,

    /// The text content
    pub content: String,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (backend info, error flags, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    fn with_role(role: ChatRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::System, content.into())
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(ChatRole::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(ChatRole::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Create a tool result message that reports a failed invocation.
    pub fn tool_error(tool_call_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let mut msg = Self::tool_result(tool_call_id, format!("Error: {error}"));
        msg.metadata
            .insert("error".into(), serde_json::Value::Bool(true));
        msg
    }

    /// Whether this message asks the kernel to run functions.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call requested by the model inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique ID for this tool call
    pub id: String,

    /// Model-facing function name (`Plugin-Function` or `Plugin.Function`)
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// An ordered, append-only sequence of chat messages owned by the caller.
///
/// Only the first message may carry the system role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history that starts with a system message.
    pub fn with_system_message(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(content)],
        }
    }

    /// Append a message, rejecting a system message anywhere but first.
    pub fn push(&mut self, message: ChatMessage) -> Result<()> {
        if message.role == ChatRole::System && !self.messages.is_empty() {
            return Err(Error::InvalidHistory(
                "a system message may only appear at the start of the history".into(),
            ));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Append a user message.
    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Append an assistant message.
    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Append several messages in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> Result<()> {
        for message in messages {
            self.push(message)?;
        }
        Ok(())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Get the total token count estimate (rough: 4 chars is about 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}

impl From<ChatHistory> for Vec<ChatMessage> {
    fn from(history: ChatHistory) -> Self {
        history.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = ChatMessage::user("Hello, kernel!");
        assert_eq!(msg.role, ChatRole::User);
        assert_eq!(msg.content, "Hello, kernel!");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn system_message_only_allowed_first() {
        let mut history = ChatHistory::with_system_message("You are terse.");
        history.add_user_message("hi");
        let err = history.push(ChatMessage::system("second")).unwrap_err();
        assert!(matches!(err, Error::InvalidHistory(_)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn system_message_accepted_on_empty_history() {
        let mut history = ChatHistory::new();
        history.push(ChatMessage::system("rules")).unwrap();
        assert_eq!(history.messages()[0].role, ChatRole::System);
    }

    #[test]
    fn tool_error_is_flagged() {
        let msg = ChatMessage::tool_error("call_1", "boom");
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.content, "Error: boom");
        assert_eq!(msg.metadata["error"], serde_json::Value::Bool(true));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatRole::Assistant).unwrap();
        assert_eq!(json, r#""assistant""#);
    }

    #[test]
    fn history_token_estimate() {
        let mut history = ChatHistory::new();
        // 20 chars is about 5 tokens
        history.add_user_message("12345678901234567890");
        assert_eq!(history.estimated_tokens(), 5);
    }
}
