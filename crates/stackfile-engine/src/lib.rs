//! Stackfile Engine - Jinja2 templating for state and values files
//!
//! This crate provides a MiniJinja-based renderer with:
//! - A fixed function library (file reads, exec, YAML, path get/set, `tpl`)
//! - A pre-render mode that stubs side effects and tolerates missing keys
//! - `ref+<scheme>://` secret reference expansion through an injected evaluator
//! - Readable errors with source spans and suggestions

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;
pub mod secrets;

pub use engine::{ReadFileFn, Renderer, TEMPLATE_EXTENSIONS, is_template_file, os_read_file};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use secrets::{CachingEvaluator, Evaluator, contains_refs};
