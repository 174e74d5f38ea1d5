//! Console adapter for local operation and development
//!
//! Chat lines go through the normal dispatch path; lines starting with `/`
//! are host control commands (reload, enable/disable, update, quit).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::application::errors::BotError;
use crate::application::messaging::parser::extract_mentions;
use crate::application::messaging::CommandDispatcher;
use crate::domain::entities::{Message, User};
use crate::domain::traits::{BotInfo, ChatAdapter};
use crate::infrastructure::scripts::ScriptHost;

const CONSOLE_CHAT: &str = "console";
const CONSOLE_BOT_ID: &str = "console-bot";

pub struct ConsoleAdapter {
    bot_name: String,
    dispatcher: Arc<CommandDispatcher>,
    scripts: Arc<ScriptHost>,
}

impl ConsoleAdapter {
    pub fn new(
        bot_name: impl Into<String>,
        dispatcher: Arc<CommandDispatcher>,
        scripts: Arc<ScriptHost>,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            dispatcher,
            scripts,
        }
    }

    /// Host control commands, outside the chat command namespace.
    /// Returns `false` when the adapter should stop.
    fn control(&self, line: &str) -> bool {
        let mut parts = line.trim_start_matches('/').split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("quit"), _) => return false,
            (Some("reload"), _) => match self.scripts.reload() {
                Ok(()) => println!("scripts reloaded"),
                Err(e) => println!("reload failed: {e}"),
            },
            (Some("enable"), Some(name)) => match self.scripts.set_enabled(name, true) {
                Ok(()) => println!("script '{name}' enabled"),
                Err(e) => println!("enable failed: {e}"),
            },
            (Some("disable"), Some(name)) => match self.scripts.set_enabled(name, false) {
                Ok(()) => println!("script '{name}' disabled"),
                Err(e) => println!("disable failed: {e}"),
            },
            (Some("update"), Some(key)) => match self.scripts.update_script(key) {
                Ok(true) => println!("script '{key}' updated"),
                Ok(false) => println!("script '{key}' is up to date"),
                Err(e) => println!("update failed: {e}"),
            },
            (Some("delete"), Some(key)) => match self.scripts.delete_script(key) {
                Ok(()) => println!("script '{key}' deleted"),
                Err(e) => println!("delete failed: {e}"),
            },
            (Some("scripts"), _) => {
                for s in self.scripts.scripts() {
                    println!(
                        "{} v{} [{}]{}",
                        s.key(),
                        s.version,
                        if s.enabled { "on" } else { "off" },
                        s.err_text
                            .as_deref()
                            .map(|e| format!(" error: {e}"))
                            .unwrap_or_default()
                    );
                }
            }
            _ => println!(
                "commands: /reload /enable <name> /disable <name> /update <key> /delete <key> /scripts /quit"
            ),
        }
        true
    }
}

#[async_trait]
impl ChatAdapter for ConsoleAdapter {
    async fn start(&self) -> Result<(), BotError> {
        info!("console adapter ready, type commands below");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('/') {
                // control commands block (reload, http); keep the runtime alive
                if !tokio::task::block_in_place(|| self.control(line)) {
                    break;
                }
                continue;
            }
            let (text, mentions) = extract_mentions(line);
            let msg = Message::from_text(CONSOLE_CHAT, text)
                .with_sender(User::new("operator", "operator"))
                .with_platform("console")
                .with_mentions(mentions);
            match self.dispatcher.dispatch(&msg) {
                Ok(replies) => {
                    for reply in replies {
                        self.send_message(CONSOLE_CHAT, &reply).await?;
                    }
                }
                Err(BotError::ReloadInProgress) => {
                    println!("busy reloading, try again in a moment");
                }
                Err(e) => warn!("dispatch failed: {}", e),
            }
        }
        Ok(())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), BotError> {
        println!("[{}] {}", chat_id, text);
        Ok(())
    }

    fn bot_info(&self) -> BotInfo {
        BotInfo {
            id: CONSOLE_BOT_ID.to_string(),
            name: self.bot_name.clone(),
            platform: "console".to_string(),
        }
    }
}
