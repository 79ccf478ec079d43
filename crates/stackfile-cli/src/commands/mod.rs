//! CLI commands

pub mod build;
pub mod destroy;
pub mod diff;
pub mod lint;
pub mod list;
pub mod status;
pub mod sync;
pub mod template;

use stackfile_core::{Map, Values};
use stackfile_event::ShellRunner;
use stackfile_state::{CommandExecutor, HelmState, LoadOptions, Loader, OsFileSystem, Overrides, Run, RunOptions};
use std::sync::Arc;

use crate::GlobalArgs;
use crate::error::{CliError, Result};
use crate::helmexec::HelmExecutor;

const DEFAULT_HELM: &str = "helm";

/// `--state-values-file` contents, then `--state-values-set` pairs
fn state_values(global: &GlobalArgs) -> Result<Map> {
    let mut values = Values::new();
    for path in &global.state_values_file {
        let content = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
        values.merge(&Values::from_yaml(&content)?);
    }
    values.merge(&stackfile_core::parse_set_values(&global.state_values_set)?);
    Ok(values.into_map()?)
}

fn overrides(global: &GlobalArgs) -> Overrides {
    Overrides {
        namespace: global.namespace.clone().unwrap_or_default(),
        kube_context: global.kube_context.clone().unwrap_or_default(),
        chart: global.chart.clone().unwrap_or_default(),
    }
}

fn executor(helm: &str) -> Arc<dyn CommandExecutor> {
    Arc::new(HelmExecutor::new(helm, Arc::new(ShellRunner::default())))
}

/// Load the state file and pick the helm binary it asks for
pub async fn load(global: &GlobalArgs) -> Result<(HelmState, Arc<dyn CommandExecutor>)> {
    let path = std::path::absolute(&global.file).map_err(|e| CliError::io(&global.file, e))?;
    let options = LoadOptions {
        environment: global.environment.clone(),
        strict: global.strict,
        allow_undefined_environment: global.allow_undefined_environment,
        state_values: state_values(global)?,
        overrides: overrides(global),
        concurrency: global.concurrency,
    };

    let helm = global.helm_binary.as_deref().unwrap_or(DEFAULT_HELM);
    let state = Loader::new(Arc::new(OsFileSystem), options)
        .executor(executor(helm))
        .load(&path, None)
        .await?;

    let helm = match &global.helm_binary {
        Some(helm) => helm.clone(),
        None if !state.helm_binary.is_empty() => state.helm_binary.clone(),
        None => DEFAULT_HELM.to_string(),
    };
    Ok((state, executor(&helm)))
}

/// Load the state and bind it to helm and the hook runner
pub async fn open(global: &GlobalArgs, cleanup_tests: bool) -> Result<Run> {
    let (state, executor) = load(global).await?;
    let runner = Arc::new(ShellRunner::new(state.base_dir.clone()));
    let options = RunOptions {
        selectors: global.selectors.clone(),
        include_transitive_needs: global.include_transitive_needs,
        concurrency: global.concurrency,
        skip_deps: global.skip_deps,
        cleanup_tests,
    };
    Ok(Run::new(state, executor, runner, options))
}
