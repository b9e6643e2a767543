//! Conversation event types.

use parlance_types::Role;
use serde::{Deserialize, Serialize};

/// Kinds of entries in a conversation's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventType {
    /// A voice session attached to the conversation.
    SessionStarted,
    /// A finalized caller utterance.
    UserMessage,
    /// A committed agent reply.
    AssistantMessage,
    /// Agent playback was cut off by the caller.
    Interrupted,
    /// The voice session ended.
    SessionEnded,
}

impl ConversationEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::Interrupted => "interrupted",
            Self::SessionEnded => "session_ended",
        }
    }
}

impl std::fmt::Display for ConversationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_started" => Ok(Self::SessionStarted),
            "user_message" => Ok(Self::UserMessage),
            "assistant_message" => Ok(Self::AssistantMessage),
            "interrupted" => Ok(Self::Interrupted),
            "session_ended" => Ok(Self::SessionEnded),
            other => Err(format!("unknown conversation event type: {other}")),
        }
    }
}

/// An event to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversationEvent {
    pub event_type: ConversationEventType,
    pub role: Option<Role>,
    pub content: Option<String>,
    /// Correlation data (call id, session key, epoch, ...).
    pub metadata: serde_json::Value,
}

impl NewConversationEvent {
    /// An event with no role or content.
    pub fn lifecycle(event_type: ConversationEventType, metadata: serde_json::Value) -> Self {
        Self {
            event_type,
            role: None,
            content: None,
            metadata,
        }
    }

    /// A `user_message` or `assistant_message` event for the given role.
    pub fn message(role: Role, content: impl Into<String>, metadata: serde_json::Value) -> Self {
        let event_type = match role {
            Role::User => ConversationEventType::UserMessage,
            Role::Assistant => ConversationEventType::AssistantMessage,
        };
        Self {
            event_type,
            role: Some(role),
            content: Some(content.into()),
            metadata,
        }
    }
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: i64,
    pub conversation_id: String,
    pub seq: i64,
    pub event_type: String,
    pub role: Option<String>,
    pub content: Option<String>,
    pub metadata: serde_json::Value,
    /// RFC 3339 timestamp.
    pub occurred_at: String,
}
