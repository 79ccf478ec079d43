//! The helm-facing command executor contract

use async_trait::async_trait;
use thiserror::Error;

use crate::document::RepositorySpec;

/// Failure reported by a [`CommandExecutor`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecError {
    pub message: String,
    /// Combined output of the failed command
    pub output: String,
}

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Per-call context for release operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelmContext {
    pub tillerless: bool,
    pub tiller_namespace: String,
    /// Index of the worker task running the call
    pub worker_index: usize,
    pub history_max: u32,
}

/// Outcome of a diff: the printed diff plus whether anything changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOutput {
    pub output: String,
    pub changed: bool,
}

/// Everything the bulk operations need from helm.
///
/// Implementations must be safe to call from several worker tasks.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn add_repo(&self, repo: &RepositorySpec) -> ExecResult<()>;
    async fn update_repos(&self) -> ExecResult<()>;
    async fn build_deps(&self, name: &str, chart: &str) -> ExecResult<()>;
    /// Download `chart` and return the local path it was unpacked to
    async fn fetch(&self, chart: &str, flags: &[String]) -> ExecResult<String>;
    async fn sync_release(&self, ctx: &HelmContext, name: &str, chart: &str, flags: &[String]) -> ExecResult<()>;
    async fn diff_release(
        &self,
        ctx: &HelmContext,
        name: &str,
        chart: &str,
        flags: &[String],
    ) -> ExecResult<DiffOutput>;
    async fn template_release(&self, name: &str, chart: &str, flags: &[String]) -> ExecResult<String>;
    async fn lint(&self, name: &str, chart: &str, flags: &[String]) -> ExecResult<String>;
    async fn release_status(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String>;
    async fn delete_release(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<()>;
    async fn test_release(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String>;
    /// Releases matching `filter`, one per line; empty when none match
    async fn list(&self, ctx: &HelmContext, filter: &str, flags: &[String]) -> ExecResult<String>;
    /// Decrypt a secrets file and return the path of the decrypted copy
    async fn decrypt_secret(&self, ctx: &HelmContext, path: &str) -> ExecResult<String>;
    async fn is_helm3(&self) -> bool;
    async fn version(&self) -> Option<semver::Version>;
}
