//! Stackfile State - Loading, planning and executing a release state
//!
//! This crate turns state files into a [`HelmState`] and runs bulk
//! operations over its releases:
//! - `loader`: Layered documents, bases, environments and templated fields
//! - `selector` / `planner`: Label selection and dependency batches
//! - `scatter`: Bounded worker pool over one batch
//! - `run`: Sync, diff, template, lint, status, test and destroy
//!
//! Command execution, the file system and remote fetches are injected
//! through the [`CommandExecutor`], [`FileSystem`] and [`Remote`] traits.

pub mod document;
mod envvals;
pub mod error;
pub mod executor;
pub mod flags;
pub mod fs;
pub mod hooks;
pub mod loader;
pub mod planner;
pub mod prepare;
pub mod run;
pub mod scatter;
pub mod selector;
pub mod state;
pub mod templating;

#[cfg(test)]
mod testing;

pub use document::{
    EnvironmentSpec, HelmDefaults, MissingFileHandler, RepositorySpec, StateDocument,
};
pub use error::{ReleaseError, Result, RunErrors, StateError};
pub use executor::{CommandExecutor, DiffOutput, ExecError, ExecResult, HelmContext};
pub use flags::{FlagBuilder, ReleaseFlags};
pub use fs::{FileSystem, LocalRemote, MemoryFileSystem, OsFileSystem, Remote};
pub use hooks::Hooks;
pub use loader::{LoadOptions, Loader};
pub use planner::{PlanOptions, group_releases_by_dependency};
pub use prepare::{PrepareOptions, SerialBuilder, prepare_charts};
pub use run::{
    AffectedRelease, AffectedReleases, ReleaseOutput, Run, RunOptions, RunReport, run_with_plan,
};
pub use scatter::{effective_concurrency, scatter_gather};
pub use selector::{LabelFilter, mark_filtered_releases};
pub use state::{HelmState, Overrides};
