// Chat message payloads for the colloquy wire protocol.

use serde::{Deserialize, Serialize};

/// A chat payload as it travels on the wire.
///
/// `message` and `timestamp` are absent on the JOIN and LEAVE envelopes
/// a client sends; the server fills in a readable system line (and a
/// timestamp) when it broadcasts them. `timestamp` is an opaque ISO-8601
/// string: display formatting belongs to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Join,
    Leave,
    #[default]
    Message,
}

impl ChatMessage {
    /// JOIN envelope announcing `username` to the room.
    pub fn join(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            message: None,
            timestamp: None,
            kind: MessageType::Join,
        }
    }

    /// LEAVE envelope for `username`.
    pub fn leave(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            message: None,
            timestamp: None,
            kind: MessageType::Leave,
        }
    }

    /// An ordinary chat line.
    pub fn chat(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            message: Some(message.into()),
            timestamp: None,
            kind: MessageType::Message,
        }
    }

    /// Whether the payload carries anything the presentation layer can
    /// show: a participant name or message text.
    #[must_use]
    pub fn has_content(&self) -> bool {
        self.username.is_some() || self.message.is_some()
    }
}
