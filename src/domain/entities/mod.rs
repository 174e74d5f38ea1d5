//! Domain entities

pub mod ban;
pub mod command;
pub mod extension;
pub mod message;
pub mod user;
pub mod vars;

pub use ban::{BanList, BanListItem, BanRank};
pub use command::{CmdContext, CmdHandler, CmdResult, Command, CommandArgs, ReplySink};
pub use extension::{ExtDefaultSetting, Extension, ExtensionRegistry, GroupInfo};
pub use message::{Content, Message, MessageType};
pub use user::User;
pub use vars::{VarStore, VarValue};
