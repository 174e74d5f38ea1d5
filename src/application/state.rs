//! Mutable host state shared between dispatch and the script bridge

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::domain::entities::{BanList, ExtensionRegistry, VarStore};

/// Everything a running host mutates from both the message path and the
/// script side. `reloading` is the reload fence: dispatch checks it per
/// message and backs off instead of racing a teardown.
#[derive(Default)]
pub struct SharedState {
    pub vars: Mutex<VarStore>,
    pub bans: Mutex<BanList>,
    pub registry: RwLock<ExtensionRegistry>,
    reloading: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the reload fence; `false` when a reload is already running
    pub fn begin_reload(&self) -> bool {
        !self.reloading.swap(true, Ordering::SeqCst)
    }

    pub fn end_reload(&self) {
        self.reloading.store(false, Ordering::SeqCst);
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }
}
