use super::User;
use chrono::{DateTime, Utc};

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Group,
    Private,
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Group => "group",
            MessageType::Private => "private",
        }
    }
}

/// Message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Command { name: String, args: Vec<String> },
    Empty,
}

impl Content {
    pub fn text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Content::Command { .. })
    }
}

/// Represents an incoming or outgoing message
#[derive(Debug, Clone)]
pub struct Message {
    pub chat_id: String,
    pub sender: Option<User>,
    pub content: Content,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    /// Users named via the platform's mention syntax, in order of appearance
    pub mentions: Vec<String>,
}

impl Message {
    pub fn new(chat_id: impl Into<String>, content: Content) -> Self {
        Self {
            chat_id: chat_id.into(),
            sender: None,
            content,
            message_type: MessageType::Group,
            timestamp: Utc::now(),
            platform: "unknown".to_string(),
            mentions: Vec::new(),
        }
    }

    pub fn from_text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(chat_id, Content::Text(text.into()))
    }

    pub fn with_sender(mut self, user: User) -> Self {
        self.sender = Some(user);
        self
    }

    pub fn with_type(mut self, mt: MessageType) -> Self {
        self.message_type = mt;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn is_private(&self) -> bool {
        self.message_type == MessageType::Private
    }
}
