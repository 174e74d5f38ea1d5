//! Extensions and the registry of currently active ones

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::application::errors::ScriptError;

use super::{CmdContext, Command, CommandArgs, Message};

pub type LoadHook = Arc<dyn Fn() + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(&CmdContext, &Message) + Send + Sync>;
pub type CommandHook = Arc<dyn Fn(&CmdContext, &Message, &CommandArgs) + Send + Sync>;
/// Observes outgoing reply text before the adapter sends it
pub type SendHook = Arc<dyn Fn(&CmdContext, &str) + Send + Sync>;

/// A named bundle of commands and lifecycle hooks, active per group
#[derive(Clone, Default)]
pub struct Extension {
    pub name: String,
    pub aliases: Vec<String>,
    pub version: String,
    pub author: String,
    pub brief: String,
    pub auto_active: bool,
    pub active_on_private: bool,
    pub official: bool,
    /// Extension names mutually exclusive with this one
    pub conflict_with: Vec<String>,
    /// Key (`author:name`) of the owning script, if script-defined
    pub source: Option<String>,

    commands: Vec<Command>,

    pub on_load: Option<LoadHook>,
    pub on_message_received: Option<MessageHook>,
    pub on_not_command_received: Option<MessageHook>,
    pub on_command_received: Option<CommandHook>,
    pub on_message_send: Option<SendHook>,
}

impl Extension {
    pub fn new(
        name: impl Into<String>,
        author: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            version: version.into(),
            auto_active: true,
            ..Default::default()
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_conflicts(mut self, names: Vec<String>) -> Self {
        self.conflict_with = names;
        self
    }

    /// Add a command. Duplicate command names within one extension are
    /// rejected rather than silently overwritten.
    pub fn add_command(&mut self, command: Command) -> Result<(), ScriptError> {
        if self.commands.iter().any(|c| c.name == command.name) {
            return Err(ScriptError::Registration(format!(
                "extension '{}' already defines command '{}'",
                self.name, command.name
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    /// Look up a command by its literal word
    pub fn command(&self, word: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == word)
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("author", &self.author)
            .field("commands", &self.commands.len())
            .finish()
    }
}

/// Per-extension defaults the operator can override
#[derive(Debug, Clone)]
pub struct ExtDefaultSetting {
    pub name: String,
    pub auto_active: bool,
    pub disabled_commands: HashSet<String>,
    pub loaded: bool,
}

/// Per-conversation activation state
#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub id: String,
    pub bot_on: bool,
    /// Activated extension names, in activation order
    pub active: Vec<String>,
    /// Activation snapshot taken before the last reload
    pub snapshot: Vec<String>,
}

impl GroupInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bot_on: true,
            ..Default::default()
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|n| n == name)
    }

    pub fn activate(&mut self, name: &str) {
        if !self.is_active(name) {
            self.active.push(name.to_string());
        }
    }

    pub fn deactivate(&mut self, name: &str) {
        self.active.retain(|n| n != name);
    }

    /// Snapshot-or-default semantics: a group that had this extension in its
    /// snapshot re-activates it; otherwise the auto-activate flag decides.
    pub fn activate_by_snapshot_or_default(&mut self, name: &str, auto_active: bool) {
        if self.snapshot.iter().any(|n| n == name) || auto_active {
            self.activate(name);
        }
    }
}

/// The set of currently active extensions. Hot add/remove; lookups keep the
/// three-tier precedence (exact name, exact alias, case-insensitive).
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<Extension>>,
    groups: HashMap<String, GroupInfo>,
    default_settings: HashMap<String, ExtDefaultSetting>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension. Name and conflict-list collisions are rejected
    /// with an error the caller logs and ignores; the host never crashes on a
    /// bad registration.
    pub fn register(&mut self, ext: Extension) -> Result<Arc<Extension>, ScriptError> {
        if self.extensions.iter().any(|e| e.name == ext.name) {
            return Err(ScriptError::Registration(format!(
                "extension '{}' is already registered",
                ext.name
            )));
        }
        for other in &self.extensions {
            if ext.conflict_with.iter().any(|n| *n == other.name)
                || other.conflict_with.iter().any(|n| *n == ext.name)
            {
                return Err(ScriptError::Registration(format!(
                    "extension '{}' conflicts with registered extension '{}'",
                    ext.name, other.name
                )));
            }
        }

        let setting = self
            .default_settings
            .entry(ext.name.clone())
            .or_insert_with(|| ExtDefaultSetting {
                name: ext.name.clone(),
                auto_active: ext.auto_active,
                disabled_commands: HashSet::new(),
                loaded: false,
            });
        setting.loaded = true;
        let auto_active = setting.auto_active;

        let ext = Arc::new(ext);
        self.extensions.push(ext.clone());

        for group in self.groups.values_mut() {
            group.activate_by_snapshot_or_default(&ext.name, auto_active);
        }
        Ok(ext)
    }

    /// Deactivate across all groups, then delete from the registry
    pub fn remove(&mut self, name: &str) -> bool {
        let found = self.extensions.iter().any(|e| e.name == name);
        if found {
            for group in self.groups.values_mut() {
                group.deactivate(name);
            }
            self.extensions.retain(|e| e.name != name);
            if let Some(setting) = self.default_settings.get_mut(name) {
                setting.loaded = false;
            }
        }
        found
    }

    /// Exact name first, then alias, then case-insensitive as a last resort
    pub fn find_by_name_or_alias(&self, s: &str) -> Option<Arc<Extension>> {
        if let Some(e) = self.extensions.iter().find(|e| e.name == s) {
            return Some(e.clone());
        }
        if let Some(e) = self.extensions.iter().find(|e| e.aliases.iter().any(|a| a == s)) {
            return Some(e.clone());
        }
        self.extensions
            .iter()
            .find(|e| {
                e.name.eq_ignore_ascii_case(s)
                    || e.aliases.iter().any(|a| a.eq_ignore_ascii_case(s))
            })
            .cloned()
    }

    /// Registration order, which is load order for script extensions
    pub fn extensions(&self) -> &[Arc<Extension>] {
        &self.extensions
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Remove every script-defined extension (used by reload teardown)
    pub fn remove_script_extensions(&mut self) {
        let names: Vec<String> = self
            .extensions
            .iter()
            .filter(|e| e.source.is_some())
            .map(|e| e.name.clone())
            .collect();
        for name in names {
            self.remove(&name);
        }
    }

    pub fn group(&self, id: &str) -> Option<&GroupInfo> {
        self.groups.get(id)
    }

    /// Fetch or create the group, activating auto-active extensions on first
    /// sight of a conversation.
    pub fn group_mut(&mut self, id: &str) -> &mut GroupInfo {
        if !self.groups.contains_key(id) {
            let mut group = GroupInfo::new(id);
            for ext in &self.extensions {
                let auto = self
                    .default_settings
                    .get(&ext.name)
                    .map(|s| s.auto_active)
                    .unwrap_or(ext.auto_active);
                if auto {
                    group.activate(&ext.name);
                }
            }
            self.groups.insert(id.to_string(), group);
        }
        self.groups.get_mut(id).expect("group just inserted")
    }

    /// Record each group's activation list as its snapshot (pre-reload)
    pub fn take_snapshots(&mut self) {
        for group in self.groups.values_mut() {
            group.snapshot = group.active.clone();
        }
    }

    pub fn default_setting(&self, name: &str) -> Option<&ExtDefaultSetting> {
        self.default_settings.get(name)
    }

    pub fn set_default_active(&mut self, name: &str, auto_active: bool) {
        if let Some(s) = self.default_settings.get_mut(name) {
            s.auto_active = auto_active;
        }
    }
}
