//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("map key {key} at `{path}` cannot be converted to a string")]
    NonStringKey { key: String, path: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values merge error: {message}")]
    ValuesMerge { message: String },

    #[error(
        "chart `{chart}` is locked at {locked}, which does not satisfy `{constraint}`\nHint: update the lock file and retry"
    )]
    LockMismatch {
        chart: String,
        locked: String,
        constraint: String,
    },

    /// A caller broke a contract of this crate. Not a user data problem.
    #[error("invariant violated: {message}")]
    Invariant { message: String },
}

impl CoreError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// True for contract violations that callers must not treat as recoverable
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
