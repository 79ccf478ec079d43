//! Error types for stackfile-event

use stackfile_engine::EngineError;
use thiserror::Error;

/// Result type for hook operations
pub type Result<T> = std::result::Result<T, HookError>;

/// Errors scoped to a single hook
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HookError {
    /// Command or argument template failed to render
    #[error("hook[{hook}]: failed to render {field}: {source}")]
    Render {
        hook: String,
        field: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The external command failed
    #[error("hook[{hook}]: command `{command}` failed: {source}")]
    CommandFailed {
        hook: String,
        command: String,
        #[source]
        source: RunError,
    },

    /// Template data for the hook could not be assembled
    #[error("hook[{hook}]: failed to build template data: {message}")]
    Context { hook: String, message: String },

    /// Invalid hook declaration
    #[error("hook[{hook}]: {message}")]
    InvalidConfig { hook: String, message: String },
}

/// A process run that did not succeed
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RunError {
    pub message: String,
    /// Whatever the process printed before failing
    pub output: String,
    /// Exit code, when the process ran to completion
    pub code: Option<i32>,
}

impl RunError {
    pub fn new(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: output.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: Option<i32>) -> Self {
        self.code = code;
        self
    }
}
