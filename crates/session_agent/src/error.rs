use std::path::PathBuf;

use session_store::SessionStoreError;
use thiserror::Error;

/// Failures surfaced by orchestrator operations.
///
/// None of these are fatal to the host: each maps to a user-visible message
/// and, for model rounds, to a status transition.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no active session for user '{0}'")]
    NoSession(String),

    #[error("{0}")]
    Validation(String),

    #[error("model gateway failed: {0}")]
    Transport(String),

    #[error("verification required: {0}")]
    Security(String),

    #[error("tool chain halted: {0}")]
    Loop(String),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to schedule background work: {0}")]
    Spawn(String),
}

impl AgentError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<VerificationError> for AgentError {
    fn from(error: VerificationError) -> Self {
        Self::Security(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Rejection raised before a sandboxed path touches the filesystem, or while
/// reading or patching it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("Path must not be empty")]
    EmptyPath,

    #[error("Path escapes sandbox root: {0}")]
    Escape(String),

    #[error("Failed to resolve path {path}: {reason}")]
    Resolve { path: String, reason: String },

    #[error("{0} is a directory, use #ls to list it")]
    IsDirectory(String),

    #[error("{0} is not a directory")]
    NotDirectory(String),

    #[error("File too large ({size_kib}KB > {limit_kib}KB)")]
    TooLarge { size_kib: u64, limit_kib: u64 },

    #[error("File is not valid UTF-8 text")]
    NotUtf8,

    #[error("{0}")]
    InvalidArguments(String),

    #[error("Search text not found in {0}")]
    SearchNotFound(String),

    #[error("{operation} failed for {path}: {reason}")]
    Io {
        operation: &'static str,
        path: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("verification is frozen for another {remaining_secs}s")]
    Frozen { remaining_secs: u64 },

    #[error("failed to deliver verification code: {0}")]
    Delivery(String),
}
