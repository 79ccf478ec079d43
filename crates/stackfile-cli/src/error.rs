//! CLI error types with exit code handling
//!
//! Every library error is folded into [`CliError`], which knows the exit
//! code the process ends with.

use miette::Diagnostic;
use stackfile_state::StateError;
use thiserror::Error;

use crate::exit_codes;

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// A state file or release field failed to render
    #[error("Template error: {message}")]
    #[diagnostic(code(stackfile::cli::template))]
    Template {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Invalid state, environment, selector or dependency graph
    #[error("State error: {message}")]
    #[diagnostic(code(stackfile::cli::state))]
    State {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// One or more releases failed
    #[error("{message}")]
    #[diagnostic(code(stackfile::cli::releases))]
    Releases { message: String },

    /// Diff found changes and `--detailed-exitcode` was given
    #[error("{count} release(s) have changes")]
    #[diagnostic(code(stackfile::cli::changes))]
    Changes { count: usize },

    #[error("IO error: {message}")]
    #[diagnostic(code(stackfile::cli::io))]
    Io { message: String },

    #[error("Invalid arguments: {message}")]
    #[diagnostic(code(stackfile::cli::usage))]
    Usage { message: String },

    /// Wrapped error for passthrough (stores the formatted message)
    #[error("{message}")]
    #[diagnostic(code(stackfile::cli::error))]
    Other { message: String },

    #[error("Internal error: {message}")]
    #[diagnostic(
        code(stackfile::cli::internal),
        help("this is a bug in stackfile, please report it")
    )]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Template { .. } => exit_codes::TEMPLATE_ERROR,
            CliError::State { .. } => exit_codes::STATE_ERROR,
            CliError::Releases { .. } => exit_codes::ERROR,
            CliError::Changes { .. } => exit_codes::DIFF_CHANGES,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Usage { .. } => exit_codes::USAGE_ERROR,
            CliError::Other { .. } => exit_codes::ERROR,
            CliError::Internal { .. } => exit_codes::INTERNAL_ERROR,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", path.display(), err),
        }
    }
}

impl From<StateError> for CliError {
    fn from(err: StateError) -> Self {
        let message = err.to_string();
        if err.is_invariant() {
            return CliError::Internal { message };
        }
        match err {
            StateError::Template { .. }
            | StateError::RecursiveReferences { .. }
            | StateError::InvalidBool { .. }
            | StateError::Engine(_) => CliError::Template {
                message,
                help: None,
            },
            StateError::Read { .. } => CliError::Io { message },
            StateError::Run(_) => CliError::Releases { message },
            StateError::Exec(_) | StateError::Hook(_) => CliError::Other { message },
            StateError::Cycle { .. } => CliError::State {
                message,
                help: Some("remove one of the `needs` entries between the listed releases".to_string()),
            },
            StateError::UnknownField { .. } => CliError::State {
                message,
                help: Some("drop --strict to ignore unknown fields".to_string()),
            },
            _ => CliError::State {
                message,
                help: None,
            },
        }
    }
}

impl From<stackfile_core::CoreError> for CliError {
    fn from(err: stackfile_core::CoreError) -> Self {
        if err.is_invariant() {
            CliError::Internal {
                message: err.to_string(),
            }
        } else {
            CliError::Usage {
                message: err.to_string(),
            }
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
