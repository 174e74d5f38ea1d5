//! Domain traits

pub mod bot;

pub use bot::{BotInfo, ChatAdapter};
