use std::sync::{Arc, Mutex};

use super::{Message, User};

/// Tri-state outcome of a command handler.
///
/// `matched` says a command pattern was recognized at all, `solved` says a
/// reply was already produced (the dispatcher must not fall through), and
/// `show_help` asks the dispatcher to emit the command's help text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdResult {
    pub matched: bool,
    pub solved: bool,
    pub show_help: bool,
}

impl CmdResult {
    pub fn solved() -> Self {
        Self {
            matched: true,
            solved: true,
            show_help: false,
        }
    }

    pub fn unmatched() -> Self {
        Self::default()
    }

    pub fn help() -> Self {
        Self {
            matched: true,
            solved: true,
            show_help: true,
        }
    }

    pub fn matched_only() -> Self {
        Self {
            matched: true,
            solved: false,
            show_help: false,
        }
    }
}

/// Parsed arguments handed to a command handler
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    /// The literal command word that matched
    pub command: String,
    pub args: Vec<String>,
    /// Everything after the command word, untouched
    pub raw_args: String,
    /// Repeat count from a leading `N#` token; 1 when absent
    pub execute_times: usize,
    /// Mention targets carried over from the message
    pub mentions: Vec<String>,
}

impl CommandArgs {
    pub fn arg(&self, n: usize) -> Option<&str> {
        self.args.get(n).map(|s| s.as_str())
    }
}

/// Collects replies produced during one dispatch so the adapter can flush
/// them after the handler chain finishes.
#[derive(Clone, Default)]
pub struct ReplySink {
    replies: Arc<Mutex<Vec<String>>>,
}

impl ReplySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(text.into());
        }
    }

    pub fn drain(&self) -> Vec<String> {
        self.replies
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.lock().map(|r| r.is_empty()).unwrap_or(true)
    }
}

/// The acting context a handler reasons about. When delegation applies, the
/// `user` is the delegated party, not the literal sender.
#[derive(Clone)]
pub struct CmdContext {
    pub group_id: String,
    pub user: User,
    pub is_private: bool,
    pub delegated: bool,
    sink: ReplySink,
}

impl CmdContext {
    pub fn new(group_id: impl Into<String>, user: User, is_private: bool, sink: ReplySink) -> Self {
        Self {
            group_id: group_id.into(),
            user,
            is_private,
            delegated: false,
            sink,
        }
    }

    /// The same context acting on behalf of another party
    pub fn delegated_to(&self, user: User) -> Self {
        let mut ctx = self.clone();
        ctx.user = user;
        ctx.delegated = true;
        ctx
    }

    pub fn reply(&self, text: impl Into<String>) {
        self.sink.push(text);
    }

    pub fn sink(&self) -> &ReplySink {
        &self.sink
    }
}

/// Command handler signature
pub type CmdHandler = Arc<dyn Fn(&CmdContext, &Message, &CommandArgs) -> CmdResult + Send + Sync>;

/// Help text generator; `true` asks for the short form
pub type HelpFn = Arc<dyn Fn(bool) -> String + Send + Sync>;

/// A single command an extension responds to
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub short_help: String,
    pub help: String,
    pub help_func: Option<HelpFn>,
    /// Acting context may be redirected to a mentioned party
    pub allow_delegate: bool,
    pub disabled_in_private: bool,
    /// Bypass activation and bot-on gating
    pub raw: bool,
    /// Parse a leading `N#` repeat token
    pub enable_execute_times_parse: bool,
    pub handler: CmdHandler,
}

impl Command {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CmdContext, &Message, &CommandArgs) -> CmdResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            short_help: String::new(),
            help: String::new(),
            help_func: None,
            allow_delegate: false,
            disabled_in_private: false,
            raw: false,
            enable_execute_times_parse: false,
            handler: Arc::new(handler),
        }
    }

    pub fn with_short_help(mut self, text: impl Into<String>) -> Self {
        self.short_help = text.into();
        self
    }

    pub fn with_help(mut self, text: impl Into<String>) -> Self {
        self.help = text.into();
        self
    }

    pub fn with_help_func<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) -> String + Send + Sync + 'static,
    {
        self.help_func = Some(Arc::new(f));
        self
    }

    pub fn allow_delegate(mut self) -> Self {
        self.allow_delegate = true;
        self
    }

    pub fn disabled_in_private(mut self) -> Self {
        self.disabled_in_private = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn with_execute_times_parse(mut self) -> Self {
        self.enable_execute_times_parse = true;
        self
    }

    /// Resolved help text. A help function wins over static text; the short
    /// form falls back to the long one when empty.
    pub fn help_text(&self, short: bool) -> String {
        if let Some(f) = &self.help_func {
            return f(short);
        }
        if short && !self.short_help.is_empty() {
            return self.short_help.clone();
        }
        if !self.help.is_empty() {
            return self.help.clone();
        }
        self.short_help.clone()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("allow_delegate", &self.allow_delegate)
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_text_precedence() {
        let cmd = Command::new("rc", |_, _, _| CmdResult::solved())
            .with_short_help(".rc <skill>")
            .with_help(".rc <skill> // roll a skill check");

        assert_eq!(cmd.help_text(true), ".rc <skill>");
        assert_eq!(cmd.help_text(false), ".rc <skill> // roll a skill check");

        let cmd = cmd.with_help_func(|short| {
            if short {
                "short".to_string()
            } else {
                "long".to_string()
            }
        });
        assert_eq!(cmd.help_text(true), "short");
        assert_eq!(cmd.help_text(false), "long");
    }

    #[test]
    fn reply_sink_collects_in_order() {
        let sink = ReplySink::new();
        sink.push("one");
        sink.push("two");
        assert_eq!(sink.drain(), vec!["one".to_string(), "two".to_string()]);
        assert!(sink.is_empty());
    }
}
