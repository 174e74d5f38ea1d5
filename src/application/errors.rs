//! Application layer errors

use thiserror::Error;

/// General bot errors
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reload in progress")]
    ReloadInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Script lifecycle errors. Metadata and dependency failures are not here
/// on purpose; they accumulate as human-readable strings on the descriptor
/// so diagnostics survive past the load pass.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Update check failed: {0}")]
    Update(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduled task errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Invalid daily time '{0}': expected 24-hour H:MM or HH:MM, e.g. 0:05 or 13:30")]
    InvalidDailyTime(String),

    #[error("Unknown task kind '{0}': only cron|daily are supported")]
    UnknownKind(String),

    #[error("Scheduler is gone")]
    SchedulerGone,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Config '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Config '{key}' rejects value: {reason}")]
    InvalidValue { key: String, reason: String },
}
