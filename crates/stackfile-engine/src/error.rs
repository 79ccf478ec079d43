//! Engine error types with source-annotated template errors

use miette::{Diagnostic, NamedSource, SourceSpan};
use stackfile_core::CoreError;
use thiserror::Error;

/// Template variables and functions, used for "did you mean" hints
pub const AVAILABLE_FUNCTIONS: &[&str] = &[
    "read_file",
    "exec",
    "to_yaml",
    "from_yaml",
    "set_value_at_path",
    "required_env",
    "get",
    "get_or_nil",
    "tpl",
];

pub const AVAILABLE_FILTERS: &[&str] = &[
    "toyaml",
    "fromyaml",
    "b64encode",
    "b64decode",
    "quote",
    "squote",
    "indent",
    "nindent",
    "required",
    "sha256",
    "trimprefix",
    "trimsuffix",
];

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path} must contain a map of values, got a {found}")]
    NotAMap { path: String, found: &'static str },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("secret reference evaluation failed: {message}")]
    Secrets { message: String },
}

impl EngineError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_invariant())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    TypeError,
    InvalidOperation,
    Other,
}

/// Template-specific error with source information
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{name}: {message}")]
#[diagnostic(code(stackfile::template::render))]
pub struct TemplateError {
    /// Template name, usually a file path or `<release>.<field>`
    pub name: String,

    pub message: String,

    pub kind: TemplateErrorKind,

    #[source_code]
    pub src: NamedSource<String>,

    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    pub fn from_minijinja(err: minijinja::Error, template_name: &str, template_source: &str) -> Self {
        let kind = categorize(&err);
        let span = err
            .line()
            .and_then(|line| calculate_span(template_source, line));

        let mut message = err.to_string();
        if let Some(detail) = err.detail() {
            if !message.contains(detail) {
                message = format!("{}: {}", message, detail);
            }
        }
        if let Some(cause) = std::error::Error::source(&err) {
            message = format!("{}: {}", message, cause);
        }

        Self {
            name: template_name.to_string(),
            suggestion: suggest(&kind, &message),
            message,
            kind,
            src: NamedSource::new(template_name, template_source.to_string()),
            span,
        }
    }

    /// Create a simple error without source mapping
    pub fn simple(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            src: NamedSource::new(name.clone(), String::new()),
            name,
            message: message.into(),
            kind: TemplateErrorKind::Other,
            span: None,
            suggestion: None,
        }
    }

    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

fn categorize(err: &minijinja::Error) -> TemplateErrorKind {
    match err.kind() {
        minijinja::ErrorKind::UndefinedError => TemplateErrorKind::UndefinedVariable,
        minijinja::ErrorKind::UnknownFilter => TemplateErrorKind::UnknownFilter,
        minijinja::ErrorKind::UnknownFunction => TemplateErrorKind::UnknownFunction,
        minijinja::ErrorKind::SyntaxError => TemplateErrorKind::SyntaxError,
        minijinja::ErrorKind::InvalidOperation => TemplateErrorKind::InvalidOperation,
        minijinja::ErrorKind::NonPrimitive | minijinja::ErrorKind::NonKey => {
            TemplateErrorKind::TypeError
        }
        _ => TemplateErrorKind::Other,
    }
}

fn suggest(kind: &TemplateErrorKind, message: &str) -> Option<String> {
    let candidates = match kind {
        TemplateErrorKind::UnknownFunction => AVAILABLE_FUNCTIONS,
        TemplateErrorKind::UnknownFilter => AVAILABLE_FILTERS,
        TemplateErrorKind::UndefinedVariable => {
            return Some(
                "templates see `environment`, `release`, `values` and `namespace`; \
                 use `get_or_nil` for optional keys"
                    .to_string(),
            );
        }
        _ => return None,
    };

    let word = message
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .min_by(|a, b| {
            best_distance(a, candidates)
                .partial_cmp(&best_distance(b, candidates))
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

    let best = candidates
        .iter()
        .map(|c| (c, strsim::jaro_winkler(word, c)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    Some(format!("did you mean `{}`?", best.0))
}

fn best_distance(word: &str, candidates: &[&str]) -> f64 {
    candidates
        .iter()
        .map(|c| 1.0 - strsim::jaro_winkler(word, c))
        .fold(f64::MAX, f64::min)
}

/// Calculate the source span for a given line number
fn calculate_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (index, line) in source.lines().enumerate() {
        if index + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_for_second_line() {
        let span = calculate_span("a: 1\nb: {{ x }}\n", 2).unwrap();
        assert_eq!(span.offset(), 5);
        assert_eq!(span.len(), 10);
    }

    #[test]
    fn test_unknown_function_suggestion() {
        let env = minijinja::Environment::new();
        let err = env.render_str("{{ reed_file('x') }}", ()).unwrap_err();
        let err = TemplateError::from_minijinja(err, "t", "{{ reed_file('x') }}");
        assert_eq!(err.kind(), TemplateErrorKind::UnknownFunction);
        assert_eq!(err.suggestion.as_deref(), Some("did you mean `read_file`?"));
    }
}
