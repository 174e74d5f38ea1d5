//! Message dispatch against the extension registry
//!
//! One dispatch snapshots the registry under its lock, then runs handlers
//! lock-free so they can re-enter the registry (extension toggles do).
//! Handlers run supervised: a panic drops that message's remaining work
//! and is logged, the host keeps serving.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::application::errors::BotError;
use crate::application::state::SharedState;
use crate::domain::entities::{
    BanRank, CmdContext, Command, CommandArgs, Extension, Message, ReplySink, User,
};

use super::parser::{self, EXECUTE_TIMES_RE};

struct ActiveExt {
    ext: Arc<Extension>,
    active: bool,
    disabled_commands: HashSet<String>,
}

/// Routes incoming messages to extension commands and hooks
pub struct CommandDispatcher {
    state: Arc<SharedState>,
    prefix: String,
    max_execute_times: usize,
    bot_id: Option<String>,
}

impl CommandDispatcher {
    pub fn new(state: Arc<SharedState>, prefix: impl Into<String>, max_execute_times: usize) -> Self {
        Self {
            state,
            prefix: prefix.into(),
            max_execute_times,
            bot_id: None,
        }
    }

    /// The bot's own id, excluded from delegation targets
    pub fn with_bot_id(mut self, id: impl Into<String>) -> Self {
        self.bot_id = Some(id.into());
        self
    }

    /// Process one message, returning the replies it produced. Refused while
    /// a reload is tearing the registry down.
    pub fn dispatch(&self, msg: &Message) -> Result<Vec<String>, BotError> {
        if self.state.is_reloading() {
            return Err(BotError::ReloadInProgress);
        }
        let Some(text) = msg.content.text() else {
            return Ok(Vec::new());
        };
        let sender = msg
            .sender
            .clone()
            .unwrap_or_else(|| User::from_id("unknown"));

        let banned = self
            .state
            .bans
            .lock()
            .map_err(|_| BotError::Internal("ban list lock poisoned".to_string()))?
            .get(&sender.id)
            .map(|item| item.rank == BanRank::Banned)
            .unwrap_or(false);
        if banned {
            debug!("dropping message from banned user {}", sender.id);
            return Ok(Vec::new());
        }

        let sink = ReplySink::new();
        let ctx = CmdContext::new(&msg.chat_id, sender, msg.is_private(), sink.clone());
        let (bot_on, exts) = self.snapshot(msg)?;

        for ae in &exts {
            if !ae.active {
                continue;
            }
            if let Some(hook) = &ae.ext.on_message_received {
                supervised(&ae.ext.name, || hook(&ctx, msg));
            }
        }

        match parser::parse_command(&self.prefix, text) {
            Some(parsed) => {
                let resolved = match resolve(&exts, &parsed.word) {
                    Some(hit) => Some((hit, 1usize, parsed.word.clone())),
                    None => EXECUTE_TIMES_RE.captures(&parsed.word).and_then(|caps| {
                        let times: usize = caps[1].parse().ok()?;
                        let word = caps[2].to_string();
                        let hit = resolve(&exts, &word)?;
                        // only commands that opt in understand the repeat token
                        hit.1.enable_execute_times_parse.then_some((hit, times, word))
                    }),
                };
                if let Some(((idx, cmd), times, word)) = resolved {
                    self.run_command(
                        &ctx, msg, &exts, bot_on, idx, &cmd, times, word, &parsed.args,
                        &parsed.raw_args,
                    );
                }
            }
            None => {
                for ae in &exts {
                    if !ae.active {
                        continue;
                    }
                    if let Some(hook) = &ae.ext.on_not_command_received {
                        supervised(&ae.ext.name, || hook(&ctx, msg));
                    }
                }
            }
        }

        let replies = sink.drain();
        if !replies.is_empty() {
            for ae in &exts {
                if !ae.active {
                    continue;
                }
                if let Some(hook) = &ae.ext.on_message_send {
                    for reply in &replies {
                        supervised(&ae.ext.name, || hook(&ctx, reply));
                    }
                }
            }
        }
        Ok(replies)
    }

    /// Copy what dispatch needs out of the registry, creating the group on
    /// first contact so auto-active extensions apply.
    fn snapshot(&self, msg: &Message) -> Result<(bool, Vec<ActiveExt>), BotError> {
        let mut registry = self
            .state
            .registry
            .write()
            .map_err(|_| BotError::Internal("registry lock poisoned".to_string()))?;
        let group = registry.group_mut(&msg.chat_id);
        let bot_on = group.bot_on;
        let active: HashSet<String> = group.active.iter().cloned().collect();
        let exts = registry
            .extensions()
            .iter()
            .map(|e| ActiveExt {
                active: if msg.is_private() {
                    e.active_on_private
                } else {
                    active.contains(&e.name)
                },
                disabled_commands: registry
                    .default_setting(&e.name)
                    .map(|s| s.disabled_commands.clone())
                    .unwrap_or_default(),
                ext: e.clone(),
            })
            .collect();
        Ok((bot_on, exts))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_command(
        &self,
        ctx: &CmdContext,
        msg: &Message,
        exts: &[ActiveExt],
        bot_on: bool,
        ext_idx: usize,
        cmd: &Command,
        times: usize,
        word: String,
        args: &[String],
        raw_args: &str,
    ) {
        let ae = &exts[ext_idx];
        // raw commands answer even when the bot or extension is off
        if !cmd.raw && (!bot_on || !ae.active) {
            return;
        }
        if msg.is_private() && cmd.disabled_in_private {
            ctx.reply(format!("the {} command does not work in private chat", cmd.name));
            return;
        }
        let times = if cmd.enable_execute_times_parse { times } else { 1 };
        if times > self.max_execute_times {
            ctx.reply(format!(
                "refusing to repeat {} times, the limit is {}",
                times, self.max_execute_times
            ));
            return;
        }

        let exec_ctx = if cmd.allow_delegate {
            msg.mentions
                .iter()
                .find(|m| self.bot_id.as_deref() != Some(m.as_str()))
                .map(|m| ctx.delegated_to(User::from_id(m)))
                .unwrap_or_else(|| ctx.clone())
        } else {
            ctx.clone()
        };

        let cmd_args = CommandArgs {
            command: word,
            args: args.to_vec(),
            raw_args: raw_args.to_string(),
            execute_times: times,
            mentions: msg.mentions.clone(),
        };

        for other in exts {
            if !other.active {
                continue;
            }
            if let Some(hook) = &other.ext.on_command_received {
                supervised(&other.ext.name, || hook(ctx, msg, &cmd_args));
            }
        }

        for _ in 0..times {
            let ran = catch_unwind(AssertUnwindSafe(|| (cmd.handler)(&exec_ctx, msg, &cmd_args)));
            match ran {
                Ok(result) => {
                    if result.show_help || (result.matched && !result.solved) {
                        ctx.reply(cmd.help_text(false));
                    }
                    if !result.matched {
                        break;
                    }
                }
                Err(_) => {
                    error!(
                        "command '{}' of extension '{}' panicked, dropping message",
                        cmd.name, ae.ext.name
                    );
                    break;
                }
            }
        }
    }
}

fn resolve(exts: &[ActiveExt], word: &str) -> Option<(usize, Command)> {
    for (i, ae) in exts.iter().enumerate() {
        if let Some(cmd) = ae.ext.command(word) {
            if ae.disabled_commands.contains(&cmd.name) {
                continue;
            }
            return Some((i, cmd.clone()));
        }
    }
    None
}

fn supervised(ext_name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("hook of extension '{}' panicked", ext_name);
    }
}
