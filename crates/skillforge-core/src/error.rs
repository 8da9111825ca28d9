use std::path::PathBuf;

use crate::types::ActivityState;

/// Errors surfaced by the backup manager and the control facade
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database file not found: {}", .0.display())]
    MissingDatabase(PathBuf),

    #[error("Not a backup artifact: {}", .0.display())]
    InvalidArtifact(PathBuf),

    #[error("Backup is corrupt: {0}")]
    CorruptBackup(String),

    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    #[error("Unknown activity state: {0}")]
    UnknownState(String),

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ActivityState,
        to: ActivityState,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
