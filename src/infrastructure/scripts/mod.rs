//! Script lifecycle: discovery, verification, resolution and hosting
//!
//! `ScriptHost` owns one sandbox generation at a time. A reload is
//! stop-the-world: snapshot group activations, tear down every
//! script-sourced extension and task, terminate the sandbox, then discover
//! and load from disk as on a fresh start.

pub mod discovery;
pub mod metadata;
pub mod resolver;
pub mod signature;
pub mod update;

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::application::errors::BotError;
use crate::application::state::SharedState;
use crate::infrastructure::config::{Config, HostState, PluginConfigManager};
use crate::infrastructure::sandbox::builtin::{core_program, CORE_KEY};
use crate::infrastructure::sandbox::{
    Bridge, NativeEngine, SandboxHost, ScriptEngine, ScriptProgram, ScriptSource,
};
use crate::infrastructure::scheduler::TaskScheduler;
use crate::infrastructure::storage::ExtensionStore;

use discovery::ScriptDiscovery;
use metadata::ScriptDescriptor;
use signature::SignatureVerifier;
use update::UpdateStatus;

/// Owns script discovery and the live sandbox generation
pub struct ScriptHost {
    config: Config,
    state: Arc<SharedState>,
    storage: Arc<ExtensionStore>,
    scheduler: Arc<TaskScheduler>,
    configs: Arc<Mutex<PluginConfigManager>>,
    host_state: Mutex<HostState>,
    programs: Mutex<HashMap<String, ScriptProgram>>,
    sandbox: Mutex<Option<(SandboxHost, Arc<Bridge>)>>,
    scripts: Mutex<Vec<ScriptDescriptor>>,
}

impl ScriptHost {
    pub fn new(
        config: Config,
        state: Arc<SharedState>,
        storage: Arc<ExtensionStore>,
        scheduler: Arc<TaskScheduler>,
        configs: Arc<Mutex<PluginConfigManager>>,
    ) -> Result<Self, BotError> {
        let host_state = HostState::load(config.state_path())?;
        let mut programs: HashMap<String, ScriptProgram> = HashMap::new();
        programs.insert(CORE_KEY.to_string(), core_program());
        Ok(Self {
            config,
            state,
            storage,
            scheduler,
            configs,
            host_state: Mutex::new(host_state),
            programs: Mutex::new(programs),
            sandbox: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
        })
    }

    /// Attach a native program to a script key before the next load
    pub fn register_program(&self, key: impl Into<String>, program: ScriptProgram) {
        if let Ok(mut programs) = self.programs.lock() {
            programs.insert(key.into(), program);
        }
    }

    /// Latest discovered batch, including disabled and failed scripts
    pub fn scripts(&self) -> Vec<ScriptDescriptor> {
        self.scripts.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn verifier(&self) -> Result<SignatureVerifier, BotError> {
        match &self.config.trust_public_key {
            Some(hex_key) => Ok(SignatureVerifier::from_hex(hex_key)?),
            None => Ok(SignatureVerifier::new(None)),
        }
    }

    /// Discover, resolve and load everything from disk into a fresh sandbox
    fn load_all(&self) -> Result<(), BotError> {
        let mut discovery = ScriptDiscovery::new(self.config.scripts_dir(), self.verifier()?);
        discovery
            .seed_builtins()
            .map_err(BotError::Script)?;

        let disabled: HashMap<String, bool> = self
            .host_state
            .lock()
            .map_err(|_| BotError::Internal("host state lock poisoned".to_string()))?
            .disabled_scripts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut batch = discovery.scan(&disabled);
        let outcome = resolver::resolve(&mut batch);
        outcome.report();

        let mut engine = NativeEngine::new();
        {
            let programs = self
                .programs
                .lock()
                .map_err(|_| BotError::Internal("program table lock poisoned".to_string()))?;
            for (key, program) in programs.iter() {
                engine.register_program(key.clone(), program.clone());
            }
        }
        let bridge = Arc::new(Bridge::new(
            self.state.clone(),
            self.storage.clone(),
            self.scheduler.clone(),
            self.configs.clone(),
        ));
        engine.install_bridge(bridge.clone());
        let sandbox = SandboxHost::spawn(Box::new(engine)).map_err(BotError::Script)?;

        for &idx in &outcome.load_order {
            if !batch[idx].enabled {
                continue;
            }
            if batch[idx].needs_compilation {
                let msg = format!(
                    "script '{}' requires compilation, which this host does not provide",
                    batch[idx].key()
                );
                warn!("{}", msg);
                batch[idx].record_errors(&[msg]);
                continue;
            }
            let code = match fs::read_to_string(&batch[idx].path) {
                Ok(code) => code,
                Err(e) => {
                    let msg = format!("cannot read '{}': {e}", batch[idx].path.display());
                    batch[idx].record_errors(&[msg]);
                    continue;
                }
            };
            let source = ScriptSource {
                key: batch[idx].key(),
                name: batch[idx].name.clone(),
                path: batch[idx].path.clone(),
                code,
                official: batch[idx].official(),
            };
            let job_bridge = bridge.clone();
            let (loaded, console) = sandbox.call(move |engine| {
                job_bridge.printer().start_record();
                let result = engine.load(&source);
                (result, job_bridge.printer().end_record())
            })?;
            if !console.is_empty() {
                info!("script '{}' load output:\n{}", batch[idx].key(), console);
            }
            if let Err(e) = loaded {
                let msg = format!("script '{}' failed to load: {e}", batch[idx].key());
                warn!("{}", msg);
                batch[idx].record_errors(&[msg]);
            }
        }

        info!(
            "scripts loaded: {} of {} enabled",
            batch.iter().filter(|s| s.enabled).count(),
            batch.len()
        );
        *self
            .scripts
            .lock()
            .map_err(|_| BotError::Internal("script list lock poisoned".to_string()))? = batch;
        *self
            .sandbox
            .lock()
            .map_err(|_| BotError::Internal("sandbox lock poisoned".to_string()))? =
            Some((sandbox, bridge));
        Ok(())
    }

    /// Full lifecycle (re)start. Used for the first load too; concurrent
    /// reloads are refused, not queued.
    pub fn reload(&self) -> Result<(), BotError> {
        if !self.state.begin_reload() {
            return Err(BotError::ReloadInProgress);
        }
        let result = self.reload_inner();
        self.state.end_reload();
        result
    }

    fn reload_inner(&self) -> Result<(), BotError> {
        {
            let mut registry = self
                .state
                .registry
                .write()
                .map_err(|_| BotError::Internal("registry lock poisoned".to_string()))?;
            registry.take_snapshots();
            registry.remove_script_extensions();
        }
        self.configs
            .lock()
            .map_err(|_| BotError::Internal("config lock poisoned".to_string()))?
            .detach_tasks();
        let old = self
            .sandbox
            .lock()
            .map_err(|_| BotError::Internal("sandbox lock poisoned".to_string()))?
            .take();
        if let Some((sandbox, bridge)) = old {
            bridge.detach_tasks();
            sandbox.terminate();
        }
        self.load_all()
    }

    /// Persist the operator's enable/disable choice and apply it via reload
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), BotError> {
        {
            let mut host_state = self
                .host_state
                .lock()
                .map_err(|_| BotError::Internal("host state lock poisoned".to_string()))?;
            if enabled {
                host_state.disabled_scripts.remove(name);
            } else {
                host_state.disabled_scripts.insert(name.to_string(), true);
            }
            host_state.save(self.config.state_path())?;
        }
        info!("script '{}' {}", name, if enabled { "enabled" } else { "disabled" });
        self.reload()
    }

    /// Check one script's update sources; applies and reloads when a newer
    /// payload is found. Returns whether anything changed.
    pub fn update_script(&self, key: &str) -> Result<bool, BotError> {
        let desc = self
            .scripts
            .lock()
            .map_err(|_| BotError::Internal("script list lock poisoned".to_string()))?
            .iter()
            .find(|s| s.key() == key)
            .cloned()
            .ok_or_else(|| BotError::NotFound(format!("script '{key}'")))?;

        match update::check_update(&desc).map_err(BotError::Script)? {
            UpdateStatus::UpToDate => Ok(false),
            UpdateStatus::Available { data, new_version, .. } => {
                info!("updating '{}' to {}", key, new_version);
                update::apply_update(&desc, &data).map_err(BotError::Script)?;
                self.reload()?;
                Ok(true)
            }
        }
    }

    /// Remove a third-party script's file and reload. Builtins are refused;
    /// they would be re-seeded on the next start anyway.
    pub fn delete_script(&self, key: &str) -> Result<(), BotError> {
        let desc = self
            .scripts
            .lock()
            .map_err(|_| BotError::Internal("script list lock poisoned".to_string()))?
            .iter()
            .find(|s| s.key() == key)
            .cloned()
            .ok_or_else(|| BotError::NotFound(format!("script '{key}'")))?;
        if desc.builtin {
            return Err(BotError::Script(crate::application::errors::ScriptError::Registration(
                format!("builtin script '{key}' cannot be deleted"),
            )));
        }
        fs::remove_file(&desc.path)
            .map_err(|e| BotError::Script(e.into()))?;
        info!("deleted script file {}", desc.path.display());
        self.reload()
    }

    /// Stop the sandbox without reloading (host shutdown)
    pub fn shutdown(&self) {
        if let Ok(mut sandbox) = self.sandbox.lock() {
            if let Some((sandbox, _)) = sandbox.take() {
                sandbox.terminate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Extension;
    use tempfile::tempdir;

    fn host_in(dir: &std::path::Path) -> ScriptHost {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        ScriptHost::new(
            config,
            Arc::new(SharedState::new()),
            Arc::new(ExtensionStore::open_in_memory().unwrap()),
            TaskScheduler::new(),
            Arc::new(Mutex::new(PluginConfigManager::new())),
        )
        .unwrap()
    }

    fn write_script(dir: &std::path::Path, file: &str, name: &str, extra: &str) {
        fs::create_dir_all(dir.join("scripts")).unwrap();
        fs::write(
            dir.join("scripts").join(file),
            format!(
                "// ==UserScript==\n// @name {name}\n// @author me\n// @version 1.0.0\n{extra}// ==/UserScript==\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn first_load_brings_up_core() {
        let tmp = tempdir().unwrap();
        let host = host_in(tmp.path());
        host.reload().unwrap();

        let registry = host.state.registry.read().unwrap();
        let core = registry.find_by_name_or_alias("core").unwrap();
        assert_eq!(core.source.as_deref(), Some(CORE_KEY));
        assert!(host.scripts().iter().any(|s| s.builtin && s.name == "core"));
    }

    #[test]
    fn native_program_loads_for_discovered_script() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        let host = host_in(tmp.path());
        host.register_program(
            "me:story",
            Arc::new(|bridge: &Bridge| {
                bridge.ext_register(Extension::new("story", "me", "1.0.0"))?;
                Ok(())
            }),
        );
        host.reload().unwrap();

        let registry = host.state.registry.read().unwrap();
        let story = registry.find_by_name_or_alias("story").unwrap();
        assert_eq!(story.source.as_deref(), Some("me:story"));
        assert!(!story.official);
    }

    #[test]
    fn reload_preserves_group_activation_choices() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        let host = host_in(tmp.path());
        host.register_program(
            "me:story",
            Arc::new(|bridge: &Bridge| {
                let mut ext = Extension::new("story", "me", "1.0.0");
                ext.auto_active = false;
                bridge.ext_register(ext)?;
                Ok(())
            }),
        );
        host.reload().unwrap();

        // operator turns story on in one group only
        {
            let mut registry = host.state.registry.write().unwrap();
            registry.group_mut("g1").activate("story");
            registry.group_mut("g2");
        }
        host.reload().unwrap();

        let registry = host.state.registry.read().unwrap();
        assert!(registry.group("g1").unwrap().is_active("story"));
        assert!(!registry.group("g2").unwrap().is_active("story"));
    }

    #[test]
    fn reload_is_idempotent_without_filesystem_changes() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        write_script(tmp.path(), "deck.js", "deck", "// @depends me:story\n");
        let host = host_in(tmp.path());

        let snapshot = |host: &ScriptHost| {
            let keys: Vec<String> = host.scripts().iter().map(|s| s.key()).collect();
            let enabled: Vec<bool> = host.scripts().iter().map(|s| s.enabled).collect();
            let registry = host.state.registry.read().unwrap();
            let exts: Vec<String> = registry
                .extensions()
                .iter()
                .map(|e| e.name.clone())
                .collect();
            (keys, enabled, exts)
        };

        host.reload().unwrap();
        let first = snapshot(&host);
        host.reload().unwrap();
        let second = snapshot(&host);

        assert_eq!(first, second);
    }

    #[test]
    fn keyless_task_does_not_accumulate_across_reloads() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        let host = host_in(tmp.path());
        host.register_program(
            "me:story",
            Arc::new(|bridge: &Bridge| {
                bridge
                    .register_task("story", "cron", "*/5 * * * *", "", "", Arc::new(|_| {}))
                    .map_err(|e| crate::application::errors::ScriptError::Engine(e.to_string()))?;
                Ok(())
            }),
        );

        host.reload().unwrap();
        assert_eq!(host.scheduler.entry_count(), 1);
        host.reload().unwrap();
        assert_eq!(host.scheduler.entry_count(), 1, "old entry torn down");
    }

    #[test]
    fn disable_persists_and_applies_on_reload() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        let host = host_in(tmp.path());
        host.set_enabled("story", false).unwrap();

        let story = host
            .scripts()
            .iter()
            .find(|s| s.name == "story")
            .cloned()
            .unwrap();
        assert!(!story.enabled);

        // a fresh host sees the same persisted choice
        let again = host_in(tmp.path());
        again.reload().unwrap();
        assert!(!again
            .scripts()
            .iter()
            .find(|s| s.name == "story")
            .unwrap()
            .enabled);
    }

    #[test]
    fn failing_dependency_disables_dependent_only() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "a.js", "solid", "");
        write_script(tmp.path(), "b.js", "leaf", "// @depends me:ghost\n");
        let host = host_in(tmp.path());
        host.reload().unwrap();

        let scripts = host.scripts();
        assert!(scripts.iter().find(|s| s.name == "solid").unwrap().enabled);
        let leaf = scripts.iter().find(|s| s.name == "leaf").unwrap();
        assert!(!leaf.enabled);
        assert!(leaf.err_text.as_ref().unwrap().contains("me:ghost"));
    }

    #[test]
    fn typescript_without_compiler_is_refused() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "typed.ts", "typed", "");
        let host = host_in(tmp.path());
        host.reload().unwrap();

        let typed = host
            .scripts()
            .iter()
            .find(|s| s.name == "typed")
            .cloned()
            .unwrap();
        assert!(!typed.enabled);
        assert!(typed.err_text.unwrap().contains("requires compilation"));
    }

    #[test]
    fn delete_removes_third_party_but_refuses_builtin() {
        let tmp = tempdir().unwrap();
        write_script(tmp.path(), "story.js", "story", "");
        let host = host_in(tmp.path());
        host.reload().unwrap();

        host.delete_script("me:story").unwrap();
        assert!(!tmp.path().join("scripts/story.js").exists());
        assert!(host.scripts().iter().all(|s| s.name != "story"));

        let err = host.delete_script(CORE_KEY).unwrap_err();
        assert!(err.to_string().contains("cannot be deleted"));
    }

    #[test]
    fn update_of_unknown_script_is_not_found() {
        let tmp = tempdir().unwrap();
        let host = host_in(tmp.path());
        host.reload().unwrap();
        assert!(matches!(
            host.update_script("me:ghost"),
            Err(BotError::NotFound(_))
        ));
    }
}
