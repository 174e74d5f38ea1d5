//! Sandboxed script runtime
//!
//! The engine is not `Sync`, so it lives on one dedicated thread and the
//! rest of the host talks to it through a job queue. A panicking job is
//! caught and logged on the sandbox thread; the queue keeps draining.
//! Dropping the sender shuts the thread down, which is how a reload tears
//! one generation down before building the next.

pub mod bridge;
pub mod builtin;
pub mod engine;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::application::errors::{BotError, ScriptError};

pub use bridge::{Bridge, Printer};
pub use engine::{NativeEngine, ScriptEngine, ScriptProgram, ScriptSource};

type Job = Box<dyn FnOnce(&mut dyn ScriptEngine) + Send>;

/// Owns the sandbox thread and its job queue
pub struct SandboxHost {
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SandboxHost {
    pub fn spawn(mut engine: Box<dyn ScriptEngine>) -> Result<Self, ScriptError> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("sandbox".to_string())
            .spawn(move || {
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(|| job(engine.as_mut()))).is_err() {
                        error!("script job panicked, sandbox continues");
                    }
                }
                engine.terminate();
                debug!("sandbox thread stopped");
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a fire-and-forget job
    pub fn submit(
        &self,
        job: impl FnOnce(&mut dyn ScriptEngine) + Send + 'static,
    ) -> Result<(), BotError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| BotError::Internal("sandbox is terminated".to_string()))?;
        tx.send(Box::new(job))
            .map_err(|_| BotError::Internal("sandbox thread is gone".to_string()))
    }

    /// Run a job and wait for its result. A job that panics aborts the call
    /// with an error instead of poisoning the caller.
    pub fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut dyn ScriptEngine) -> T + Send + 'static,
    ) -> Result<T, BotError> {
        let (rtx, rrx) = mpsc::channel();
        self.submit(move |engine| {
            let _ = rtx.send(f(engine));
        })?;
        rrx.recv()
            .map_err(|_| BotError::Internal("script call aborted".to_string()))
    }

    /// Stop accepting jobs, drain the queue and join the thread
    pub fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("sandbox thread ended with a panic");
            }
        }
    }
}

impl Drop for SandboxHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::application::state::SharedState;
    use crate::infrastructure::config::PluginConfigManager;
    use crate::infrastructure::scheduler::TaskScheduler;
    use crate::infrastructure::storage::ExtensionStore;

    fn native_host() -> (SandboxHost, Arc<Bridge>) {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SharedState::new()),
            Arc::new(ExtensionStore::open_in_memory().unwrap()),
            TaskScheduler::new(),
            Arc::new(Mutex::new(PluginConfigManager::new())),
        ));
        let mut engine = NativeEngine::new();
        engine.install_bridge(bridge.clone());
        let host = SandboxHost::spawn(Box::new(engine)).unwrap();
        (host, bridge)
    }

    #[test]
    fn call_returns_job_result() {
        let (host, _bridge) = native_host();
        let n = host.call(|_| 41 + 1).unwrap();
        assert_eq!(n, 42);
        host.terminate();
    }

    #[test]
    fn panicking_job_does_not_kill_the_sandbox() {
        let (host, _bridge) = native_host();
        let aborted = host.call(|_| -> usize { panic!("script blew up") });
        assert!(aborted.is_err());

        let n = host.call(|_| 7).unwrap();
        assert_eq!(n, 7, "queue still drains after a panic");
        host.terminate();
    }

    #[test]
    fn load_runs_native_program_through_bridge() {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SharedState::new()),
            Arc::new(ExtensionStore::open_in_memory().unwrap()),
            TaskScheduler::new(),
            Arc::new(Mutex::new(PluginConfigManager::new())),
        ));
        let mut engine = NativeEngine::new();
        engine.install_bridge(bridge.clone());
        engine.register_program(
            "me:demo",
            Arc::new(|b: &Bridge| {
                b.ext_register(crate::domain::entities::Extension::new("demo", "me", "1.0.0"))?;
                Ok(())
            }),
        );
        let host = SandboxHost::spawn(Box::new(engine)).unwrap();

        let source = ScriptSource {
            key: "me:demo".to_string(),
            name: "demo".to_string(),
            path: PathBuf::from("demo.js"),
            code: String::new(),
            official: false,
        };
        host.call(move |engine| engine.load(&source)).unwrap().unwrap();

        let ext = bridge.ext_find("demo").unwrap();
        assert_eq!(ext.source.as_deref(), Some("me:demo"));
        assert!(!ext.official);
        host.terminate();
    }
}
