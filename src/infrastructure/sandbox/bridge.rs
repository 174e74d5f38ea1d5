//! Capability bridge between scripts and the host
//!
//! Scripts never touch host internals directly; every capability they get
//! is a method here, grouped into small typed namespaces. The bridge is
//! built once per sandbox generation and installed into the engine before
//! any script loads.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::application::errors::{BotError, ScriptError, StorageError};
use crate::application::state::SharedState;
use crate::domain::entities::{BanListItem, CmdContext, Extension, Message, VarValue};
use crate::infrastructure::config::{ConfigValue, PluginConfigManager};
use crate::infrastructure::scheduler::{ScheduledTask, TaskFn, TaskKind, TaskScheduler};
use crate::infrastructure::scripts::metadata::HOST_VERSION;
use crate::infrastructure::storage::ExtensionStore;

/// Script console output, mirrored to host logs and optionally recorded
/// so load-time output can be attached to the script's record.
#[derive(Default)]
pub struct Printer {
    record: Mutex<Option<Vec<String>>>,
}

impl Printer {
    fn push(&self, line: String) {
        if let Ok(mut record) = self.record.lock() {
            if let Some(lines) = record.as_mut() {
                lines.push(line);
            }
        }
    }

    pub fn log(&self, source: &str, text: &str) {
        info!("[script:{}] {}", source, text);
        self.push(text.to_string());
    }

    pub fn warn(&self, source: &str, text: &str) {
        warn!("[script:{}] {}", source, text);
        self.push(format!("warn: {text}"));
    }

    pub fn error(&self, source: &str, text: &str) {
        error!("[script:{}] {}", source, text);
        self.push(format!("error: {text}"));
    }

    pub fn start_record(&self) {
        if let Ok(mut record) = self.record.lock() {
            *record = Some(Vec::new());
        }
    }

    pub fn end_record(&self) -> String {
        self.record
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct LoadingScript {
    key: String,
    official: bool,
}

/// Group-scoped variable access
pub struct VarsNs<'a> {
    state: &'a SharedState,
}

impl VarsNs<'_> {
    pub fn int_get(&self, group_id: &str, key: &str) -> Option<i64> {
        self.state.vars.lock().ok()?.int_get(group_id, key)
    }

    pub fn int_set(&self, group_id: &str, key: &str, value: i64) {
        if let Ok(mut vars) = self.state.vars.lock() {
            vars.int_set(group_id, key, value);
        }
    }

    pub fn str_get(&self, group_id: &str, key: &str) -> Option<String> {
        self.state.vars.lock().ok()?.str_get(group_id, key)
    }

    pub fn str_set(&self, group_id: &str, key: &str, value: &str) {
        if let Ok(mut vars) = self.state.vars.lock() {
            vars.str_set(group_id, key, value);
        }
    }

    pub fn computed_set(&self, group_id: &str, key: &str, expr: &str) {
        if let Ok(mut vars) = self.state.vars.lock() {
            vars.computed_set(group_id, key, expr);
        }
    }
}

/// Ban/trust list access
pub struct BanNs<'a> {
    state: &'a SharedState,
}

impl BanNs<'_> {
    pub fn add_score(&self, id: &str, score: i64, place: &str, reason: &str) {
        if let Ok(mut bans) = self.state.bans.lock() {
            bans.add_score(id, score, place, reason);
        }
    }

    pub fn add_ban(&self, id: &str, place: &str, reason: &str) {
        if let Ok(mut bans) = self.state.bans.lock() {
            bans.add_ban(id, place, reason);
        }
    }

    pub fn set_trust(&self, id: &str, place: &str, reason: &str) {
        if let Ok(mut bans) = self.state.bans.lock() {
            bans.set_trust(id, place, reason);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.state
            .bans
            .lock()
            .map(|mut b| b.remove(id))
            .unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<BanListItem> {
        self.state.bans.lock().ok()?.get(id).cloned()
    }

    pub fn list(&self) -> Vec<BanListItem> {
        self.state.bans.lock().map(|b| b.list()).unwrap_or_default()
    }
}

/// The capability surface handed to scripts
pub struct Bridge {
    state: Arc<SharedState>,
    storage: Arc<ExtensionStore>,
    scheduler: Arc<TaskScheduler>,
    configs: Arc<Mutex<PluginConfigManager>>,
    printer: Printer,
    loading: Mutex<Option<LoadingScript>>,
    /// Keyless task handles registered through this bridge generation.
    /// Keyed tasks live on their config items; keyless ones are pinned here
    /// so reload can turn their entries off with the rest of the teardown.
    keyless_tasks: Mutex<Vec<Arc<ScheduledTask>>>,
}

impl Bridge {
    pub fn new(
        state: Arc<SharedState>,
        storage: Arc<ExtensionStore>,
        scheduler: Arc<TaskScheduler>,
        configs: Arc<Mutex<PluginConfigManager>>,
    ) -> Self {
        Self {
            state,
            storage,
            scheduler,
            configs,
            printer: Printer::default(),
            loading: Mutex::new(None),
            keyless_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn printer(&self) -> &Printer {
        &self.printer
    }

    /// Host version exposed to scripts
    pub fn version(&self) -> String {
        HOST_VERSION.to_string()
    }

    pub fn vars(&self) -> VarsNs<'_> {
        VarsNs { state: &self.state }
    }

    pub fn ban(&self) -> BanNs<'_> {
        BanNs { state: &self.state }
    }

    /// Mark the script whose load is in progress; registrations done until
    /// `end_load` are attributed to it.
    pub fn begin_load(&self, key: &str, official: bool) {
        if let Ok(mut loading) = self.loading.lock() {
            *loading = Some(LoadingScript {
                key: key.to_string(),
                official,
            });
        }
    }

    pub fn end_load(&self) {
        if let Ok(mut loading) = self.loading.lock() {
            *loading = None;
        }
    }

    pub fn loading_key(&self) -> Option<String> {
        self.loading.lock().ok()?.as_ref().map(|l| l.key.clone())
    }

    pub fn ext_find(&self, name: &str) -> Option<Arc<Extension>> {
        self.state
            .registry
            .read()
            .ok()?
            .find_by_name_or_alias(name)
    }

    /// Register an extension with the live registry. The owning script and
    /// its trust are stamped on from the load in progress; a rejected
    /// registration is logged and returned, never fatal.
    pub fn ext_register(&self, mut ext: Extension) -> Result<Arc<Extension>, ScriptError> {
        if let Ok(loading) = self.loading.lock() {
            if let Some(l) = loading.as_ref() {
                ext.source = Some(l.key.clone());
                ext.official = l.official;
            }
        }
        let registered = {
            let mut registry = self
                .state
                .registry
                .write()
                .map_err(|_| ScriptError::Registration("registry lock poisoned".to_string()))?;
            registry.register(ext)
        };
        match registered {
            Ok(ext) => {
                // outside the registry lock so the hook may re-enter it
                if let Some(hook) = &ext.on_load {
                    let hook = hook.clone();
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())).is_err() {
                        error!("on_load of extension '{}' panicked", ext.name);
                    }
                }
                Ok(ext)
            }
            Err(e) => {
                warn!("extension registration rejected: {}", e);
                Err(e)
            }
        }
    }

    pub fn storage_get(&self, ext: &str, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get(ext, key)
    }

    pub fn storage_set(&self, ext: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set(ext, key, value)
    }

    /// Structured storage; values are kept as JSON text
    pub fn storage_get_json<T: serde::de::DeserializeOwned>(
        &self,
        ext: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.storage.get(ext, key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn storage_set_json<T: serde::Serialize>(
        &self,
        ext: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        self.storage.set(ext, key, &serde_json::to_string(value)?)
    }

    pub fn config_register(
        &self,
        ext: &str,
        key: &str,
        default: ConfigValue,
        description: &str,
    ) -> Result<(), BotError> {
        let mut configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        configs.register(ext, key, default, description);
        Ok(())
    }

    pub fn config_get_string(&self, ext: &str, key: &str) -> Result<String, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_string(ext, key)?)
    }

    pub fn config_get_int(&self, ext: &str, key: &str) -> Result<i64, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_int(ext, key)?)
    }

    pub fn config_get_bool(&self, ext: &str, key: &str) -> Result<bool, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_bool(ext, key)?)
    }

    pub fn config_get_float(&self, ext: &str, key: &str) -> Result<f64, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_float(ext, key)?)
    }

    pub fn config_get_template(&self, ext: &str, key: &str) -> Result<Vec<String>, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_template(ext, key)?)
    }

    pub fn config_get_option(&self, ext: &str, key: &str) -> Result<String, BotError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        Ok(configs.get_option(ext, key)?)
    }

    /// Drop a config item entirely, stored value included
    pub fn config_unregister(&self, ext: &str, key: &str) -> Result<(), BotError> {
        let mut configs = self
            .configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
        configs.unregister(ext, key);
        Ok(())
    }

    /// Register a periodic task. With a non-empty `key` the schedule becomes
    /// an operator-visible config item: a persisted operator override wins
    /// over the script's expression, and re-registration under the same key
    /// turns the previous handle off before the new one goes live.
    pub fn register_task(
        &self,
        ext: &str,
        kind: &str,
        expr: &str,
        key: &str,
        description: &str,
        callback: TaskFn,
    ) -> Result<Arc<ScheduledTask>, BotError> {
        let declared = TaskKind::parse(kind)?;

        let (effective_kind, effective_expr) = if key.is_empty() {
            (declared, expr.to_string())
        } else {
            let mut configs = self
                .configs
                .lock()
                .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
            configs.register(
                ext,
                key,
                ConfigValue::Task {
                    kind: declared.as_str().to_string(),
                    value: expr.to_string(),
                },
                description,
            );
            let (stored_kind, stored_expr) = configs.get_task(ext, key)?;
            if let Some(item) = configs.item_mut(ext, key) {
                if let Some(old) = item.task.take() {
                    let _ = old.off();
                }
            }
            (TaskKind::parse(&stored_kind)?, stored_expr)
        };

        let task = self
            .scheduler
            .register_task(ext, effective_kind, &effective_expr, callback, key)?;

        if key.is_empty() {
            if let Ok(mut tasks) = self.keyless_tasks.lock() {
                tasks.push(task.clone());
            }
        } else {
            let mut configs = self
                .configs
                .lock()
                .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?;
            if let Some(item) = configs.item_mut(ext, key) {
                item.task = Some(task.clone());
            }
        }
        Ok(task)
    }

    /// Turn off every keyless task this bridge generation registered. Called
    /// during reload teardown; keyed tasks are detached through the config
    /// manager instead.
    pub fn detach_tasks(&self) {
        let tasks: Vec<Arc<ScheduledTask>> = match self.keyless_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return,
        };
        for task in tasks {
            let _ = task.off();
        }
    }

    pub fn reply_group(&self, ctx: &CmdContext, text: &str) {
        if !ctx.is_private {
            ctx.reply(text);
        }
    }

    pub fn reply_person(&self, ctx: &CmdContext, text: &str) {
        ctx.reply(text);
    }

    pub fn reply_to_sender(&self, ctx: &CmdContext, msg: &Message, text: &str) {
        if msg.is_private() {
            self.reply_person(ctx, text);
        } else {
            self.reply_group(ctx, text);
        }
    }

    /// Substitute `{key}` placeholders from the group's variables. Unknown
    /// keys are left intact.
    pub fn format(&self, group_id: &str, template: &str) -> String {
        let Ok(vars) = self.state.vars.lock() else {
            return template.to_string();
        };
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    match vars.get(group_id, key) {
                        Some(VarValue::Int(v)) => out.push_str(&v.to_string()),
                        Some(VarValue::Str(v)) => out.push_str(v),
                        Some(VarValue::Computed(expr)) => out.push_str(expr),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
