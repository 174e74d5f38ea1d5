//! Infrastructure layer: config, storage, scripts, sandbox and adapters

pub mod adapters;
pub mod config;
pub mod sandbox;
pub mod scheduler;
pub mod scripts;
pub mod storage;
