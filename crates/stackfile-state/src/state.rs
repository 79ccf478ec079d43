//! The loaded state: releases plus everything needed to render and run them

use indexmap::IndexMap;
use serde_json::{Value as JsonValue, json};
use stackfile_core::{ChartLock, Environment, EnvironmentContext, Hook, Map, Release, ReleaseContext, ReleaseSpec};
use stackfile_engine::{Evaluator, Renderer};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::document::{EnvironmentSpec, HelmDefaults, RepositorySpec, StateDocument};
use crate::error::{Result, StateError};
use crate::executor::HelmContext;
use crate::fs::{self, FileSystem};
use crate::planner::{self, PlanOptions};
use crate::selector;

/// Values that replace what every release declares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub namespace: String,
    pub kube_context: String,
    pub chart: String,
}

pub struct HelmState {
    pub file_path: PathBuf,
    pub base_dir: PathBuf,
    pub releases: Vec<ReleaseSpec>,
    pub repositories: Vec<RepositorySpec>,
    pub environments: IndexMap<String, EnvironmentSpec>,
    pub helm_defaults: HelmDefaults,
    pub hooks: Vec<Hook>,
    pub common_labels: IndexMap<String, String>,
    pub helm_binary: String,
    pub env: Environment,
    pub lock: Option<ChartLock>,
    rendered_values: Option<Map>,
    fs: Arc<dyn FileSystem>,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl std::fmt::Debug for HelmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelmState")
            .field("file_path", &self.file_path)
            .field("environment", &self.env.name)
            .field("releases", &self.releases.len())
            .finish()
    }
}

impl HelmState {
    pub fn new(
        file_path: impl Into<PathBuf>,
        document: StateDocument,
        env: Environment,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let file_path = file_path.into();
        let base_dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            file_path,
            base_dir,
            releases: document.releases,
            repositories: document.repositories,
            environments: document.environments,
            helm_defaults: document.helm_defaults,
            hooks: document.hooks,
            common_labels: document.common_labels,
            helm_binary: document.helm_binary,
            env,
            lock: None,
            rendered_values: None,
            fs,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Option<Arc<dyn Evaluator>>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Defaults overlaid by environment values, as seen by release templates.
    ///
    /// Reading them before the loader computed them is a programming error.
    pub fn rendered_values(&self) -> Result<&Map> {
        self.rendered_values
            .as_ref()
            .ok_or_else(|| StateError::invariant("rendered values read before the state was loaded"))
    }

    pub fn set_rendered_values(&mut self, values: Map) {
        self.rendered_values = Some(values);
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Full-mode renderer rooted at the state file's directory
    pub fn renderer(&self) -> Renderer {
        Renderer::builder(&self.base_dir)
            .file_reader(fs::reader(self.fs.clone()))
            .evaluator(self.evaluator.clone())
            .build()
    }

    pub fn environment_context(&self) -> EnvironmentContext {
        EnvironmentContext::from(&self.env)
    }

    /// Template data for one release: `environment`, `release`, `values`
    pub fn release_template_data(&self, spec: &ReleaseSpec) -> Result<JsonValue> {
        Ok(json!({
            "environment": self.environment_context(),
            "release": ReleaseContext::from(spec),
            "values": self.rendered_values()?,
        }))
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        for spec in &mut self.releases {
            if !overrides.namespace.is_empty() {
                spec.namespace = overrides.namespace.clone();
            }
            if !overrides.kube_context.is_empty() {
                spec.kube_context = overrides.kube_context.clone();
            }
            if !overrides.chart.is_empty() {
                spec.chart = overrides.chart.clone();
            }
        }
    }

    /// Kube context for a release: its own, then the environment's, then
    /// the helm defaults.
    pub fn kube_context_for(&self, spec: &ReleaseSpec) -> String {
        if !spec.kube_context.is_empty() {
            return spec.kube_context.clone();
        }
        match self.env.kube_context.as_deref() {
            Some(ctx) if !ctx.is_empty() => ctx.to_string(),
            _ => self.helm_defaults.kube_context.clone(),
        }
    }

    pub fn helm_context(&self, spec: &ReleaseSpec, worker_index: usize) -> HelmContext {
        let tiller_namespace = if spec.tiller_namespace.is_empty() {
            self.helm_defaults.tiller_namespace.clone()
        } else {
            spec.tiller_namespace.clone()
        };
        HelmContext {
            tillerless: spec.tillerless.unwrap_or(self.helm_defaults.tillerless),
            tiller_namespace,
            worker_index,
            history_max: spec
                .history_max
                .or(self.helm_defaults.history_max)
                .unwrap_or(10),
        }
    }

    /// Concrete chart version, pinned by the lock file when there is one
    pub fn resolve_version(&self, spec: &ReleaseSpec) -> Result<String> {
        if let Some(lock) = &self.lock
            && let Some(locked) = lock.resolve_version(&spec.chart, &spec.version)?
        {
            return Ok(locked);
        }
        Ok(spec.version.clone())
    }

    /// Releases wrapped with their selection state
    pub fn select(&self, selectors: &[String], include_transitive_needs: bool) -> Result<Vec<Release>> {
        selector::mark_filtered_releases(
            &self.releases,
            selectors,
            &self.common_labels,
            self.rendered_values()?,
            include_transitive_needs,
        )
    }

    pub fn plan(&self, selectors: &[String], include_transitive_needs: bool, reverse: bool) -> Result<Vec<Vec<Release>>> {
        let releases = self.select(selectors, include_transitive_needs)?;
        planner::group_releases_by_dependency(&releases, PlanOptions { reverse })
    }
}
