//! Stackfile Core - Core types for declarative release orchestration
//!
//! This crate provides the foundational types used throughout Stackfile:
//! - `Values`: Configuration values with nil-aware deep merge
//! - `Environment`: Named value layers with copy-on-merge semantics
//! - `ReleaseSpec`: One deployable unit and its identity
//! - `Hook`: Lifecycle hook declarations
//! - `ChartLock`: Version lookup against a dependency lock file

pub mod context;
pub mod environment;
pub mod error;
pub mod hook;
pub mod lock;
pub mod release;
pub mod values;

pub use context::{EnvironmentContext, ReleaseContext};
pub use environment::Environment;
pub use error::{CoreError, Result};
pub use hook::{Hook, KubectlApply};
pub use lock::{ChartLock, LockedChart};
pub use release::{Release, ReleaseSpec, SetValue, ValuesEntry};
pub use values::{
    Map, Values, cast_keys_to_strings, deep_merge, get_path, merge_append, merge_maps,
    parse_set_values, set_path,
};
