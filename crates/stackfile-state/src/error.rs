//! Error types for stackfile-state

use stackfile_core::CoreError;
use stackfile_engine::EngineError;
use stackfile_event::HookError;
use thiserror::Error;

use crate::executor::ExecError;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised while loading, planning or running a state
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A single YAML document could not be decoded
    #[error("failed to load {file}, document {index}: {message}")]
    Load {
        file: String,
        index: usize,
        message: String,
    },

    #[error("{file}, document {index}: `charts` and `releases` cannot be used together, use `releases` only")]
    ConflictingReleaseKeys { file: String, index: usize },

    /// Strict mode found a key that is not part of the state schema
    #[error("{file}, document {index}: unknown field `{field}` in {section}{}", .suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default())]
    UnknownField {
        file: String,
        index: usize,
        section: String,
        field: String,
        suggestion: Option<String>,
    },

    #[error("{file}: base {base} declares its own bases, nested bases are unsupported")]
    NestedBases { file: String, base: String },

    #[error("environment \"{name}\" is not defined{}", .suggestion.as_ref().map(|s| format!(" (did you mean \"{}\"?)", s)).unwrap_or_default())]
    UndefinedEnvironment {
        name: String,
        suggestion: Option<String>,
    },

    #[error("no file matches {pattern} in environment \"{environment}\"")]
    MissingFile { pattern: String, environment: String },

    #[error("release \"{release}\": failed to render {field}: {source}")]
    Template {
        release: String,
        field: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("release \"{release}\": recursive references can't be resolved after {iterations} iterations")]
    RecursiveReferences { release: String, iterations: usize },

    #[error("release \"{release}\": {field} must render to a boolean, got `{value}`")]
    InvalidBool {
        release: String,
        field: String,
        value: String,
    },

    #[error("malformed label `{term}` in selector `{selector}`: expected k=v or k!=v")]
    Selector { selector: String, term: String },

    #[error("release \"{release}\": {message}")]
    Condition { release: String, message: String },

    #[error("release \"{release}\" needs \"{need}\", which is not defined")]
    UndefinedNeed { release: String, need: String },

    #[error("release \"{release}\" needs \"{need}\", which matches several releases: {}", .candidates.join(", "))]
    AmbiguousNeed {
        release: String,
        need: String,
        candidates: Vec<String>,
    },

    #[error("dependency cycle between releases: {}", .ids.join(", "))]
    Cycle { ids: Vec<String> },

    #[error("remote {location}: {message}")]
    Remote { location: String, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Run(#[from] RunErrors),

    #[error("invariant violated: {message}")]
    Invariant { message: String },
}

impl StateError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Programming-contract violation rather than bad input
    pub fn is_invariant(&self) -> bool {
        match self {
            Self::Invariant { .. } => true,
            Self::Core(e) => e.is_invariant(),
            Self::Engine(e) => e.is_invariant(),
            Self::Template { source, .. } => source.is_invariant(),
            _ => false,
        }
    }
}

/// Failure of one release inside a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("release \"{name}\" ({id}) failed: {message}")]
pub struct ReleaseError {
    pub id: String,
    pub name: String,
    pub message: String,
}

impl ReleaseError {
    pub fn new(id: impl Into<String>, name: impl Into<String>, message: impl ToString) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Every release failure of a run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} release(s) failed:\n{}", .0.len(), summary(.0))]
pub struct RunErrors(pub Vec<ReleaseError>);

fn summary(errors: &[ReleaseError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
