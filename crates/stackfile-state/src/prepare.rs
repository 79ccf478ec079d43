//! Chart preparation before a bulk operation
//!
//! Local charts get their dependencies built, remote charts are optionally
//! fetched. Dependency builds go through one dedicated task so that two
//! releases sharing a chart never build it at the same time.

use std::collections::HashMap;
use std::sync::Arc;

use stackfile_core::{Release, ReleaseSpec};
use stackfile_event::PREPARE;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ReleaseError, Result, StateError};
use crate::executor::{CommandExecutor, ExecError, ExecResult};
use crate::hooks::Hooks;
use crate::scatter::{effective_concurrency, scatter_gather};
use crate::state::HelmState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    pub concurrency: usize,
    pub skip_deps: bool,
    /// Download remote charts instead of passing their reference through
    pub fetch_remote: bool,
}

struct BuildRequest {
    name: String,
    chart: String,
    reply: oneshot::Sender<ExecResult<()>>,
}

/// Handle to the task that serialises dependency builds.
///
/// Each chart path is built at most once per builder; later requests for
/// the same path get the first result. The task stops once every handle
/// is dropped.
#[derive(Clone)]
pub struct SerialBuilder {
    requests: mpsc::UnboundedSender<BuildRequest>,
}

impl SerialBuilder {
    pub fn spawn(executor: Arc<dyn CommandExecutor>) -> (Self, JoinHandle<()>) {
        let (requests, mut inbox) = mpsc::unbounded_channel::<BuildRequest>();
        let task = tokio::spawn(async move {
            let mut built: HashMap<String, ExecResult<()>> = HashMap::new();
            while let Some(request) = inbox.recv().await {
                let result = match built.get(&request.chart) {
                    Some(result) => result.clone(),
                    None => {
                        tracing::info!("building dependencies of {}", request.chart);
                        let result = executor.build_deps(&request.name, &request.chart).await;
                        built.insert(request.chart.clone(), result.clone());
                        result
                    }
                };
                let _ = request.reply.send(result);
            }
        });
        (Self { requests }, task)
    }

    pub async fn build(&self, name: &str, chart: &str) -> ExecResult<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(BuildRequest {
                name: name.to_string(),
                chart: chart.to_string(),
                reply,
            })
            .map_err(|_| ExecError::new("dependency builder is gone"))?;
        response
            .await
            .map_err(|_| ExecError::new("dependency builder stopped before replying"))?
    }
}

/// Prepare the chart of every selected release.
///
/// Returns the chart reference to use per release id, or the per-release
/// failures.
pub async fn prepare_charts(
    state: &Arc<HelmState>,
    releases: &[Release],
    executor: Arc<dyn CommandExecutor>,
    hooks: &Hooks,
    options: PrepareOptions,
) -> std::result::Result<HashMap<String, String>, Vec<ReleaseError>> {
    let selected: Vec<ReleaseSpec> = releases
        .iter()
        .filter(|r| !r.filtered)
        .map(|r| r.spec.clone())
        .collect();
    let workers = {
        let specs: Vec<&ReleaseSpec> = selected.iter().collect();
        effective_concurrency(options.concurrency, &specs, &state.helm_defaults)
    };
    let count = selected.len();

    let (builder, build_task) = SerialBuilder::spawn(Arc::clone(&executor));
    let worker_builder = builder.clone();
    let state = Arc::clone(state);
    let hooks = hooks.clone();

    let outcome = scatter_gather(
        workers,
        count,
        |tx| {
            for spec in selected {
                if tx.send(spec).is_err() {
                    break;
                }
            }
        },
        move |_, spec: ReleaseSpec| {
            let state = Arc::clone(&state);
            let executor = Arc::clone(&executor);
            let hooks = hooks.clone();
            let builder = worker_builder.clone();
            async move {
                let result = prepare_one(&state, &spec, executor.as_ref(), &hooks, &builder, options).await;
                (spec.id(), spec.name.clone(), result)
            }
        },
        |results| {
            let mut charts = HashMap::new();
            let mut errors = Vec::new();
            for (id, name, result) in results {
                match result {
                    Ok(chart) => {
                        charts.insert(id, chart);
                    }
                    Err(e) => errors.push(ReleaseError::new(id, name, e)),
                }
            }
            if errors.is_empty() {
                Ok(charts)
            } else {
                errors.sort_by(|a, b| a.id.cmp(&b.id));
                Err(errors)
            }
        },
    )
    .await;

    drop(builder);
    if let Err(e) = build_task.await {
        tracing::error!(error = %e, "dependency builder panicked");
    }
    outcome
}

async fn prepare_one(
    state: &HelmState,
    spec: &ReleaseSpec,
    executor: &dyn CommandExecutor,
    hooks: &Hooks,
    builder: &SerialBuilder,
    options: PrepareOptions,
) -> Result<String> {
    hooks.fire_release(spec, PREPARE, None).await?;

    if spec.is_local_chart() {
        let path = state.resolve(&spec.chart);
        if !state.fs().directory_exists(&path) {
            return Err(StateError::Read {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "chart directory does not exist"),
            });
        }
        let chart = path.display().to_string();
        let skip = options.skip_deps || spec.skip_deps.unwrap_or(state.helm_defaults.skip_deps);
        if !skip {
            builder.build(&spec.name, &chart).await?;
        }
        return Ok(chart);
    }

    if options.fetch_remote {
        let mut flags = Vec::new();
        let version = state.resolve_version(spec)?;
        if !version.is_empty() {
            flags.push("--version".to_string());
            flags.push(version);
        }
        if spec.devel.unwrap_or(state.helm_defaults.devel) {
            flags.push("--devel".to_string());
        }
        return Ok(executor.fetch(&spec.chart, &flags).await?);
    }

    Ok(spec.chart.clone())
}
