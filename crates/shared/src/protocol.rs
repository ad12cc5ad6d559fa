use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::UserId;

/// Canonical chat message as persisted and returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        rename = "sender",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub user_id: UserId,
    #[serde(default = "typing_default")]
    pub is_typing: bool,
}

fn typing_default() -> bool {
    true
}

/// One frame on the chat channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    ChatMessage {
        message: Message,
    },
    Typing(TypingNotice),
    #[serde(other)]
    Unknown,
}

impl ChannelEvent {
    pub fn decode(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// Frames only the client originates. The server stamps the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Typing { is_typing: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default = "upload_status_default")]
    pub status: String,
    pub message: Message,
}

fn upload_status_default() -> String {
    "success".to_string()
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}
