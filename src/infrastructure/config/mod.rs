//! Host configuration and per-extension typed config items

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::application::errors::ConfigError;
use crate::infrastructure::scheduler::ScheduledTask;

/// Top-level host configuration, loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub bot_name: String,
    pub command_prefix: String,
    pub data_dir: PathBuf,
    /// Upper bound for the `N#` repeat token on commands that opt in
    pub max_execute_times: usize,
    /// Hex-encoded Ed25519 public key for official-script verification
    pub trust_public_key: Option<String>,
    pub adapters: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: "tavern".to_string(),
            command_prefix: ".".to_string(),
            data_dir: PathBuf::from("./data"),
            max_execute_times: 12,
            trust_public_key: None,
            adapters: vec!["console".to_string()],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("extensions.db")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.yaml")
    }

    pub fn plugin_config_path(&self) -> PathBuf {
        self.data_dir.join("plugin-configs.yaml")
    }
}

/// Typed value of one extension config item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConfigValue {
    String { value: String },
    Int { value: i64 },
    Bool { value: bool },
    Float { value: f64 },
    /// A list of reply templates; one is picked at random on use
    Template { value: Vec<String> },
    /// A value constrained to a fixed option list
    Option { value: String, options: Vec<String> },
    /// A schedule expression: kind is `cron` or `daily`
    Task { kind: String, value: String },
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::String { .. } => "string",
            ConfigValue::Int { .. } => "int",
            ConfigValue::Bool { .. } => "bool",
            ConfigValue::Float { .. } => "float",
            ConfigValue::Template { .. } => "template",
            ConfigValue::Option { .. } => "option",
            ConfigValue::Task { .. } => "task",
        }
    }
}

/// One registered config item. The stored value survives restarts; the
/// default and description are refreshed on every registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value: ConfigValue,
    pub default_value: ConfigValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Live schedule handle for task items, rebuilt on every load
    #[serde(skip)]
    pub task: Option<Arc<ScheduledTask>>,
}

fn mismatch(key: &str, expected: &'static str, actual: &'static str) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
        actual,
    }
}

/// Per-extension config items with YAML persistence. Values set by the
/// operator are kept across reloads even while the owning extension is
/// absent; registration re-attaches defaults without clobbering them.
#[derive(Default)]
pub struct PluginConfigManager {
    path: Option<PathBuf>,
    configs: BTreeMap<String, BTreeMap<String, ConfigItem>>,
}

impl PluginConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let configs = match fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            configs,
        })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, serde_yaml::to_string(&self.configs)?)?;
            debug!("plugin configs saved to {}", path.display());
        }
        Ok(())
    }

    /// Register an item with its default. A persisted value of the same type
    /// wins over the default; a persisted value of a different type is
    /// discarded with a log line.
    pub fn register(
        &mut self,
        ext: &str,
        key: &str,
        default: ConfigValue,
        description: impl Into<String>,
    ) {
        let items = self.configs.entry(ext.to_string()).or_default();
        let description = description.into();
        match items.get_mut(key) {
            Some(item) if item.value.type_name() == default.type_name() => {
                item.default_value = default;
                item.description = description;
            }
            Some(item) => {
                info!(
                    "config '{}:{}' changed type {} -> {}, resetting to default",
                    ext,
                    key,
                    item.value.type_name(),
                    default.type_name()
                );
                item.value = default.clone();
                item.default_value = default;
                item.description = description;
                item.task = None;
            }
            None => {
                items.insert(
                    key.to_string(),
                    ConfigItem {
                        key: key.to_string(),
                        value: default.clone(),
                        default_value: default,
                        description,
                        task: None,
                    },
                );
            }
        }
    }

    pub fn unregister(&mut self, ext: &str, key: &str) {
        if let Some(items) = self.configs.get_mut(ext) {
            if let Some(item) = items.remove(key) {
                if let Some(task) = item.task {
                    let _ = task.off();
                }
            }
            if items.is_empty() {
                self.configs.remove(ext);
            }
        }
    }

    pub fn item(&self, ext: &str, key: &str) -> Option<&ConfigItem> {
        self.configs.get(ext)?.get(key)
    }

    pub fn item_mut(&mut self, ext: &str, key: &str) -> Option<&mut ConfigItem> {
        self.configs.get_mut(ext)?.get_mut(key)
    }

    pub fn items(&self, ext: &str) -> Vec<&ConfigItem> {
        self.configs
            .get(ext)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    fn value(&self, ext: &str, key: &str) -> Result<&ConfigValue, ConfigError> {
        self.item(ext, key)
            .map(|i| &i.value)
            .ok_or_else(|| ConfigError::MissingField(format!("{ext}:{key}")))
    }

    pub fn get_string(&self, ext: &str, key: &str) -> Result<String, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::String { value } => Ok(value.clone()),
            other => Err(mismatch(key, "string", other.type_name())),
        }
    }

    pub fn get_int(&self, ext: &str, key: &str) -> Result<i64, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Int { value } => Ok(*value),
            other => Err(mismatch(key, "int", other.type_name())),
        }
    }

    pub fn get_bool(&self, ext: &str, key: &str) -> Result<bool, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Bool { value } => Ok(*value),
            other => Err(mismatch(key, "bool", other.type_name())),
        }
    }

    pub fn get_float(&self, ext: &str, key: &str) -> Result<f64, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Float { value } => Ok(*value),
            other => Err(mismatch(key, "float", other.type_name())),
        }
    }

    pub fn get_template(&self, ext: &str, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Template { value } => Ok(value.clone()),
            other => Err(mismatch(key, "template", other.type_name())),
        }
    }

    pub fn get_option(&self, ext: &str, key: &str) -> Result<String, ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Option { value, .. } => Ok(value.clone()),
            other => Err(mismatch(key, "option", other.type_name())),
        }
    }

    pub fn get_task(&self, ext: &str, key: &str) -> Result<(String, String), ConfigError> {
        match self.value(ext, key)? {
            ConfigValue::Task { kind, value } => Ok((kind.clone(), value.clone())),
            other => Err(mismatch(key, "task", other.type_name())),
        }
    }

    /// Overwrite an item's value, keeping its type
    pub fn set_value(&mut self, ext: &str, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        let item = self
            .item_mut(ext, key)
            .ok_or_else(|| ConfigError::MissingField(format!("{ext}:{key}")))?;
        if item.value.type_name() != value.type_name() {
            return Err(mismatch(key, item.value.type_name(), value.type_name()));
        }
        if let (ConfigValue::Option { options, .. }, ConfigValue::Option { value: chosen, .. }) =
            (&item.default_value, &value)
        {
            if !options.contains(chosen) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("'{chosen}' is not one of {options:?}"),
                });
            }
        }
        item.value = value;
        Ok(())
    }

    /// Drop all live task handles (reload teardown); persisted items stay
    pub fn detach_tasks(&mut self) {
        for items in self.configs.values_mut() {
            for item in items.values_mut() {
                if let Some(task) = item.task.take() {
                    let _ = task.off();
                }
            }
        }
    }
}

/// Small persisted host state separate from operator config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HostState {
    /// Script names the operator disabled; survives restarts
    pub disabled_scripts: BTreeMap<String, bool>,
}

impl HostState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(dir) = path.as_ref().parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn host_config_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let mut config = Config::default();
        config.command_prefix = "!".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.command_prefix, "!");
        assert_eq!(loaded.max_execute_times, 12);
    }

    #[test]
    fn typed_get_enforces_type() {
        let mut mgr = PluginConfigManager::new();
        mgr.register("story", "limit", ConfigValue::Int { value: 5 }, "");

        assert_eq!(mgr.get_int("story", "limit").unwrap(), 5);
        let err = mgr.get_string("story", "limit").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TypeMismatch { expected: "string", actual: "int", .. }
        ));
    }

    #[test]
    fn reregistration_keeps_operator_value() {
        let mut mgr = PluginConfigManager::new();
        mgr.register("story", "limit", ConfigValue::Int { value: 5 }, "old");
        mgr.set_value("story", "limit", ConfigValue::Int { value: 9 }).unwrap();

        mgr.register("story", "limit", ConfigValue::Int { value: 7 }, "new");
        assert_eq!(mgr.get_int("story", "limit").unwrap(), 9, "value kept");
        let item = mgr.item("story", "limit").unwrap();
        assert_eq!(item.default_value, ConfigValue::Int { value: 7 });
        assert_eq!(item.description, "new");
    }

    #[test]
    fn type_change_resets_to_new_default() {
        let mut mgr = PluginConfigManager::new();
        mgr.register("story", "limit", ConfigValue::Int { value: 5 }, "");
        mgr.register(
            "story",
            "limit",
            ConfigValue::String { value: "five".to_string() },
            "",
        );
        assert_eq!(mgr.get_string("story", "limit").unwrap(), "five");
    }

    #[test]
    fn persistence_survives_reload() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("plugin-configs.yaml");

        let mut mgr = PluginConfigManager::load(&path).unwrap();
        mgr.register(
            "story",
            "greeting",
            ConfigValue::Template { value: vec!["hi".to_string()] },
            "",
        );
        mgr.set_value(
            "story",
            "greeting",
            ConfigValue::Template { value: vec!["yo".to_string()] },
        )
        .unwrap();
        mgr.save().unwrap();

        let reloaded = PluginConfigManager::load(&path).unwrap();
        assert_eq!(
            reloaded.get_template("story", "greeting").unwrap(),
            vec!["yo".to_string()]
        );
    }

    #[test]
    fn option_value_must_be_in_the_option_list() {
        let mut mgr = PluginConfigManager::new();
        mgr.register(
            "story",
            "tone",
            ConfigValue::Option {
                value: "grim".to_string(),
                options: vec!["grim".to_string(), "light".to_string()],
            },
            "",
        );
        assert!(mgr
            .set_value(
                "story",
                "tone",
                ConfigValue::Option { value: "light".to_string(), options: Vec::new() },
            )
            .is_ok());
        let err = mgr
            .set_value(
                "story",
                "tone",
                ConfigValue::Option { value: "noir".to_string(), options: Vec::new() },
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(mgr.get_option("story", "tone").unwrap(), "light");
    }

    #[test]
    fn set_value_rejects_wrong_type() {
        let mut mgr = PluginConfigManager::new();
        mgr.register("story", "on", ConfigValue::Bool { value: true }, "");
        assert!(mgr
            .set_value("story", "on", ConfigValue::Int { value: 1 })
            .is_err());
    }

    #[test]
    fn host_state_defaults_when_absent() {
        let tmp = tempdir().unwrap();
        let state = HostState::load(tmp.path().join("state.yaml")).unwrap();
        assert!(state.disabled_scripts.is_empty());
    }
}
