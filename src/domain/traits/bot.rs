use async_trait::async_trait;

use crate::application::errors::BotError;

/// Abstraction for messaging platform adapters. Wire-level connection
/// handling and message translation live behind this seam.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Start the adapter and begin listening for messages
    async fn start(&self) -> Result<(), BotError>;

    /// Send a message to a chat
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), BotError>;

    /// Get adapter info
    fn bot_info(&self) -> BotInfo;
}

/// Adapter identity, used for self-mention filtering
#[derive(Debug, Clone)]
pub struct BotInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
}
