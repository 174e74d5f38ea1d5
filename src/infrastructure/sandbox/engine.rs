//! Script engine abstraction
//!
//! The host drives scripts through the `ScriptEngine` trait so the concrete
//! runtime can change without touching the lifecycle code. The shipped
//! `NativeEngine` executes compiled-in programs keyed by `author:name`;
//! script files carry the metadata and the program supplies the behavior.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::application::errors::ScriptError;

use super::bridge::Bridge;

/// A script handed to the engine for execution
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// `author:name`
    pub key: String,
    pub name: String,
    pub path: PathBuf,
    pub code: String,
    pub official: bool,
}

/// A compiled-in script body. It receives the capability bridge and does
/// its registrations through it, exactly as an interpreted script would.
pub type ScriptProgram = Arc<dyn Fn(&Bridge) -> Result<(), ScriptError> + Send + Sync>;

/// Engine seam: load scripts, tear the runtime down
pub trait ScriptEngine: Send {
    /// Attach the capability bridge before any `load` call
    fn install_bridge(&mut self, bridge: Arc<Bridge>);

    fn load(&mut self, source: &ScriptSource) -> Result<(), ScriptError>;

    /// Drop all runtime state; the engine is not used afterwards
    fn terminate(&mut self);
}

/// Engine hosting native programs instead of interpreting script bodies
#[derive(Default)]
pub struct NativeEngine {
    bridge: Option<Arc<Bridge>>,
    programs: HashMap<String, ScriptProgram>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_program(&mut self, key: impl Into<String>, program: ScriptProgram) {
        self.programs.insert(key.into(), program);
    }
}

impl ScriptEngine for NativeEngine {
    fn install_bridge(&mut self, bridge: Arc<Bridge>) {
        self.bridge = Some(bridge);
    }

    fn load(&mut self, source: &ScriptSource) -> Result<(), ScriptError> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| ScriptError::Engine("no bridge installed".to_string()))?;

        let Some(program) = self.programs.get(&source.key).cloned() else {
            // Metadata-only script: nothing to execute in this engine
            debug!("no native program for script '{}', metadata only", source.key);
            return Ok(());
        };

        info!("loading script: {}", source.key);
        bridge.begin_load(&source.key, source.official);
        let result = program(bridge);
        bridge.end_load();
        result
    }

    fn terminate(&mut self) {
        self.programs.clear();
        self.bridge = None;
    }
}
