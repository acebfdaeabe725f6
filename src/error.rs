use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Conditions that abort a whole run. Everything recoverable is reported as
/// data instead (see [`SkipEvent`]).
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("scan root {path} is missing or unreadable: {source}")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scan root {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Policy(#[source] serde_json::Error),

    #[error("failed to parse category rules: {0}")]
    Rules(#[source] serde_json::Error),

    #[error("invalid exclude pattern `{pattern}`: {source}")]
    ExcludePattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid category pattern `{pattern}`: {source}")]
    CategoryPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// Entry could not be listed or stat'ed during enumeration.
    PathError,
    /// File vanished or became unreadable while hashing.
    HashError,
}

/// A path the run stepped over, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SkipEvent {
    pub kind: SkipKind,
    pub path: PathBuf,
    pub reason: String,
}

impl SkipEvent {
    pub fn path_error(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SkipEvent {
            kind: SkipKind::PathError,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn hash_error(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SkipEvent {
            kind: SkipKind::HashError,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why one approved action could not be carried out. Other actions in the
/// same run are unaffected.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("target no longer exists")]
    Missing,

    #[error("no backup location available")]
    NoBackupLocation,

    #[error("backup copy failed: {0}")]
    BackupCopy(#[source] std::io::Error),

    #[error("backup verification failed: {0}")]
    BackupVerify(String),

    #[error("remove failed: {0}")]
    Remove(#[source] std::io::Error),

    #[error("apply cancelled")]
    Cancelled,

    #[error("no photo optimizer configured")]
    NoOptimizer,

    #[error("photo optimization failed: {0}")]
    Optimize(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
