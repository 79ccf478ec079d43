//! Bulk operations over a loaded state
//!
//! Every operation plans the selected releases into dependency batches, runs
//! the batches one after the other and fans each batch out over a bounded
//! worker pool. Workers return plain result records; the aggregate phase is
//! the only place where the report is updated.

use std::collections::HashMap;
use std::sync::Arc;

use stackfile_core::{Release, ReleaseSpec};
use stackfile_event::{CLEANUP, POSTSYNC, POSTUNINSTALL, PREPARE, PRESYNC, PREUNINSTALL, Runner};

use crate::error::{ReleaseError, Result, RunErrors, StateError};
use crate::executor::CommandExecutor;
use crate::flags::{self, FlagBuilder};
use crate::hooks::Hooks;
use crate::prepare::{PrepareOptions, prepare_charts};
use crate::scatter::{effective_concurrency, scatter_gather};
use crate::state::HelmState;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub selectors: Vec<String>,
    pub include_transitive_needs: bool,
    /// Worker count per batch, 0 for one worker per release
    pub concurrency: usize,
    pub skip_deps: bool,
    /// Pass `--cleanup` to helm 2 test runs
    pub cleanup_tests: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedRelease {
    pub id: String,
    pub name: String,
    pub chart: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedReleases {
    pub upgraded: Vec<AffectedRelease>,
    pub deleted: Vec<AffectedRelease>,
    pub failed: Vec<AffectedRelease>,
}

impl AffectedReleases {
    pub fn is_empty(&self) -> bool {
        self.upgraded.is_empty() && self.deleted.is_empty() && self.failed.is_empty()
    }
}

/// Captured output of one release, e.g. a diff or rendered manifests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutput {
    pub id: String,
    pub name: String,
    pub output: String,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub affected: AffectedReleases,
    /// Per-release output, in plan order
    pub outputs: Vec<ReleaseOutput>,
    /// Set when at least one diff reported changes
    pub changed: bool,
    pub errors: Vec<ReleaseError>,
}

impl RunReport {
    pub fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(StateError::Run(RunErrors(self.errors)))
        }
    }

    fn absorb(&mut self, finished: Vec<Finished>) -> Vec<ReleaseError> {
        let mut errors = Vec::new();
        for done in finished {
            match done.result {
                Ok(Outcome::Upgraded { version }) => self.affected.upgraded.push(AffectedRelease {
                    version,
                    ..done.release
                }),
                Ok(Outcome::Deleted) => self.affected.deleted.push(done.release),
                Ok(Outcome::Output { output, changed }) => {
                    self.changed |= changed;
                    self.outputs.push(ReleaseOutput {
                        id: done.release.id,
                        name: done.release.name,
                        output,
                    });
                }
                Ok(Outcome::Skipped) => {}
                Err(e) => {
                    errors.push(ReleaseError::new(&done.release.id, &done.release.name, e));
                    self.affected.failed.push(done.release);
                }
            }
        }
        self.errors.extend(errors.iter().cloned());
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Sync,
    Diff,
    Template,
    Lint,
    Status,
    Test,
    Destroy,
}

impl Operation {
    fn command(self) -> &'static str {
        match self {
            Operation::Sync => "sync",
            Operation::Diff => "diff",
            Operation::Template => "template",
            Operation::Lint => "lint",
            Operation::Status => "status",
            Operation::Test => "test",
            Operation::Destroy => "destroy",
        }
    }

    fn uses_charts(self) -> bool {
        matches!(
            self,
            Operation::Sync | Operation::Diff | Operation::Template | Operation::Lint
        )
    }
}

enum Outcome {
    Upgraded { version: String },
    Deleted,
    Output { output: String, changed: bool },
    Skipped,
}

struct Finished {
    index: usize,
    release: AffectedRelease,
    result: Result<Outcome>,
}

/// Run `batches` strictly in order, skipping filtered releases.
///
/// `run_batch` receives the batch index and its selected releases and
/// returns the failures of that batch. The first failing batch stops the
/// plan.
pub async fn run_with_plan<F>(batches: &[Vec<Release>], mut run_batch: F) -> std::result::Result<(), RunErrors>
where
    F: AsyncFnMut(usize, Vec<Release>) -> Vec<ReleaseError>,
{
    for (index, batch) in batches.iter().enumerate() {
        let selected: Vec<Release> = batch.iter().filter(|r| !r.filtered).cloned().collect();
        if selected.is_empty() {
            continue;
        }
        tracing::debug!(
            batch = index,
            releases = ?selected.iter().map(Release::id).collect::<Vec<_>>(),
            "running batch"
        );
        let errors = run_batch(index, selected).await;
        if !errors.is_empty() {
            return Err(RunErrors(errors));
        }
    }
    Ok(())
}

/// One loaded state bound to its collaborators.
///
/// Cloning shares the state; worker tasks each hold a clone.
#[derive(Clone)]
pub struct Run {
    state: Arc<HelmState>,
    executor: Arc<dyn CommandExecutor>,
    runner: Arc<dyn Runner>,
    options: RunOptions,
}

impl Run {
    pub fn new(
        state: HelmState,
        executor: Arc<dyn CommandExecutor>,
        runner: Arc<dyn Runner>,
        options: RunOptions,
    ) -> Self {
        Self {
            state: Arc::new(state),
            executor,
            runner,
            options,
        }
    }

    pub fn state(&self) -> &HelmState {
        &self.state
    }

    pub async fn sync(&self) -> Result<RunReport> {
        self.execute(Operation::Sync).await
    }

    pub async fn diff(&self) -> Result<RunReport> {
        self.execute(Operation::Diff).await
    }

    pub async fn template(&self) -> Result<RunReport> {
        self.execute(Operation::Template).await
    }

    pub async fn lint(&self) -> Result<RunReport> {
        self.execute(Operation::Lint).await
    }

    pub async fn status(&self) -> Result<RunReport> {
        self.execute(Operation::Status).await
    }

    pub async fn test(&self) -> Result<RunReport> {
        self.execute(Operation::Test).await
    }

    /// Delete every selected release, dependents first
    pub async fn destroy(&self) -> Result<RunReport> {
        self.execute(Operation::Destroy).await
    }

    /// Register the state's repositories and refresh their indexes
    pub async fn sync_repositories(&self) -> Result<()> {
        if self.state.repositories.is_empty() {
            return Ok(());
        }
        for repo in &self.state.repositories {
            tracing::debug!(repository = %repo.name, "adding repository");
            self.executor.add_repo(repo).await?;
        }
        self.executor.update_repos().await?;
        Ok(())
    }

    async fn execute(&self, operation: Operation) -> Result<RunReport> {
        let batches = self.state.plan(
            &self.options.selectors,
            self.options.include_transitive_needs,
            operation == Operation::Destroy,
        )?;
        let hooks = Hooks::new(Arc::clone(&self.state), Arc::clone(&self.runner), operation.command());

        hooks.fire_global(PREPARE).await?;

        let charts = if operation.uses_charts() {
            self.sync_repositories().await?;
            let releases: Vec<Release> = batches.iter().flatten().cloned().collect();
            let options = PrepareOptions {
                concurrency: self.options.concurrency,
                skip_deps: self.options.skip_deps,
                fetch_remote: operation == Operation::Lint,
            };
            prepare_charts(&self.state, &releases, Arc::clone(&self.executor), &hooks, options)
                .await
                .map_err(|errors| StateError::Run(RunErrors(errors)))?
        } else {
            HashMap::new()
        };
        let charts = Arc::new(charts);

        let mut report = RunReport::default();
        let outcome = run_with_plan(&batches, async |_, batch| {
            self.run_batch(operation, batch, &charts, &hooks, &mut report).await
        })
        .await;

        if let Err(e) = hooks.fire_global(CLEANUP).await {
            tracing::warn!("cleanup hook failed: {}", e);
        }

        if let Err(RunErrors(errors)) = outcome {
            tracing::debug!(failed = errors.len(), "stopping after failed batch");
        }
        Ok(report)
    }

    async fn run_batch(
        &self,
        operation: Operation,
        batch: Vec<Release>,
        charts: &Arc<HashMap<String, String>>,
        hooks: &Hooks,
        report: &mut RunReport,
    ) -> Vec<ReleaseError> {
        let workers = {
            let specs: Vec<&ReleaseSpec> = batch.iter().map(|r| &r.spec).collect();
            effective_concurrency(self.options.concurrency, &specs, &self.state.helm_defaults)
        };
        let count = batch.len();
        let run = self.clone();
        let charts = Arc::clone(charts);
        let hooks = hooks.clone();

        scatter_gather(
            workers,
            count,
            |tx| {
                for item in batch.into_iter().map(|r| r.spec).enumerate() {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            },
            move |worker, (index, spec): (usize, ReleaseSpec)| {
                let run = run.clone();
                let charts = Arc::clone(&charts);
                let hooks = hooks.clone();
                async move {
                    tracing::debug!(worker, release = %spec.name, "{} started", operation.command());
                    let id = spec.id();
                    let chart = charts.get(&id).cloned().unwrap_or_else(|| spec.chart.clone());
                    let result = run.run_one(operation, &spec, &chart, &hooks, worker).await;
                    tracing::debug!(worker, release = %spec.name, ok = result.is_ok(), "{} finished", operation.command());
                    Finished {
                        index,
                        release: AffectedRelease {
                            id,
                            name: spec.name.clone(),
                            chart,
                            version: spec.version.clone(),
                        },
                        result,
                    }
                }
            },
            |results| {
                let mut finished: Vec<Finished> = results.collect();
                finished.sort_by_key(|f| f.index);
                report.absorb(finished)
            },
        )
        .await
    }

    async fn run_one(
        &self,
        operation: Operation,
        spec: &ReleaseSpec,
        chart: &str,
        hooks: &Hooks,
        worker: usize,
    ) -> Result<Outcome> {
        let builder = FlagBuilder::new(&self.state, self.executor.as_ref(), worker).await;
        let ctx = self.state.helm_context(spec, worker);

        match operation {
            Operation::Sync => self.sync_one(spec, chart, hooks, worker).await,
            Operation::Destroy => self.delete_one(spec, hooks, worker).await,
            _ if !spec.desired() => Ok(Outcome::Skipped),
            Operation::Diff => {
                let flags = builder.diff(spec).await?;
                let diff = self.executor.diff_release(&ctx, &spec.name, chart, &flags.flags).await;
                flags::cleanup(self.state.fs().as_ref(), &flags.temp_files);
                let diff = diff?;
                Ok(Outcome::Output {
                    output: diff.output,
                    changed: diff.changed,
                })
            }
            Operation::Template => {
                let flags = builder.template(spec).await?;
                let output = self.executor.template_release(&spec.name, chart, &flags.flags).await;
                flags::cleanup(self.state.fs().as_ref(), &flags.temp_files);
                Ok(Outcome::Output {
                    output: output?,
                    changed: false,
                })
            }
            Operation::Lint => {
                let flags = builder.lint(spec).await?;
                let output = self.executor.lint(&spec.name, chart, &flags.flags).await;
                flags::cleanup(self.state.fs().as_ref(), &flags.temp_files);
                Ok(Outcome::Output {
                    output: output?,
                    changed: false,
                })
            }
            Operation::Status => Ok(Outcome::Output {
                output: self
                    .executor
                    .release_status(&ctx, &spec.name, &builder.status(spec))
                    .await?,
                changed: false,
            }),
            Operation::Test => Ok(Outcome::Output {
                output: self
                    .executor
                    .test_release(&ctx, &spec.name, &builder.test(spec, self.options.cleanup_tests))
                    .await?,
                changed: false,
            }),
        }
    }

    async fn sync_one(&self, spec: &ReleaseSpec, chart: &str, hooks: &Hooks, worker: usize) -> Result<Outcome> {
        if !spec.desired() {
            return self.delete_one(spec, hooks, worker).await;
        }

        let builder = FlagBuilder::new(&self.state, self.executor.as_ref(), worker).await;
        let ctx = self.state.helm_context(spec, worker);

        hooks.fire_release(spec, PRESYNC, None).await?;

        let flags = builder.upgrade(spec).await?;
        let synced = self
            .executor
            .sync_release(&ctx, &spec.name, chart, &flags.flags)
            .await
            .map_err(StateError::from);
        flags::cleanup(self.state.fs().as_ref(), &flags.temp_files);

        let event_error = synced.as_ref().err().map(ToString::to_string);
        if let Err(e) = hooks.fire_release(spec, POSTSYNC, event_error.as_deref()).await {
            tracing::warn!(release = %spec.name, "postsync hook failed: {}", e);
        }
        synced?;

        Ok(Outcome::Upgraded {
            version: self.state.resolve_version(spec)?,
        })
    }

    async fn delete_one(&self, spec: &ReleaseSpec, hooks: &Hooks, worker: usize) -> Result<Outcome> {
        let builder = FlagBuilder::new(&self.state, self.executor.as_ref(), worker).await;
        let ctx = self.state.helm_context(spec, worker);

        let installed = self
            .executor
            .list(&ctx, &format!("^{}$", spec.name), &builder.status(spec))
            .await?;
        if installed.trim().is_empty() {
            tracing::debug!(release = %spec.name, "not installed, nothing to delete");
            return Ok(Outcome::Skipped);
        }

        hooks.fire_release(spec, PREUNINSTALL, None).await?;
        self.executor.delete_release(&ctx, &spec.name, &builder.delete(spec)).await?;
        hooks.fire_release(spec, POSTUNINSTALL, None).await?;
        Ok(Outcome::Deleted)
    }
}
