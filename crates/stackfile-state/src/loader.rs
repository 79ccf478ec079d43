//! State file loading
//!
//! A state file is parsed document by document, layered over its bases,
//! bound to an environment and finally has its releases rendered.
//! Template state files (`.gotmpl`, `.j2`) are rendered twice: a
//! side-effect-free pass discovers the environments, then a full pass runs
//! against the loaded environment.

use serde_json::{Value as JsonValue, json};
use stackfile_core::{ChartLock, Environment, EnvironmentContext, Map, merge_append};
use stackfile_engine::{Evaluator, Renderer, is_template_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::document::{self, StateDocument};
use crate::error::{Result, StateError};
use crate::executor::CommandExecutor;
use crate::fs::{self, FileSystem, LocalRemote, Remote};
use crate::state::{HelmState, Overrides};

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Environment to bind the state to
    pub environment: String,
    /// Reject unknown keys in state files
    pub strict: bool,
    /// Accept environment names the state does not declare
    pub allow_undefined_environment: bool,
    /// Values merged over the environment's, from the command line
    pub state_values: Map,
    pub overrides: Overrides,
    /// Workers used to decrypt environment secrets; 0 means one per file
    pub concurrency: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            environment: stackfile_core::environment::DEFAULT_ENVIRONMENT.to_string(),
            strict: false,
            allow_undefined_environment: false,
            state_values: Map::new(),
            overrides: Overrides::default(),
            concurrency: 0,
        }
    }
}

pub struct Loader {
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) remote: Arc<dyn Remote>,
    pub(crate) executor: Option<Arc<dyn CommandExecutor>>,
    pub(crate) evaluator: Option<Arc<dyn Evaluator>>,
    pub(crate) options: LoadOptions,
}

impl Loader {
    pub fn new(fs: Arc<dyn FileSystem>, options: LoadOptions) -> Self {
        Self {
            fs,
            remote: Arc::new(LocalRemote),
            executor: None,
            evaluator: None,
            options,
        }
    }

    pub fn remote(mut self, remote: Arc<dyn Remote>) -> Self {
        self.remote = remote;
        self
    }

    /// Executor used to decrypt environment secrets
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn evaluator(mut self, evaluator: Option<Arc<dyn Evaluator>>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Load a top-level state file.
    ///
    /// `parent` is the environment of an enclosing state, if any; it is the
    /// base the state's own environment is merged onto.
    pub async fn load(&self, path: &Path, parent: Option<&Environment>) -> Result<HelmState> {
        let file = path.display().to_string();
        tracing::debug!(file = %file, environment = %self.options.environment, "loading state");

        let merged = self.read_layers(path, parent).await?;
        let document = document::decode(&file, merged)?;
        let base_dir = base_dir(path);

        let env = self.load_environment(&document, &base_dir, parent).await?;
        let rendered_values = env.merged_values()?;
        let lock = self.load_lock(&document, &base_dir)?;

        let mut state = HelmState::new(path, document, env, self.fs.clone()).with_evaluator(self.evaluator.clone());
        state.lock = lock;
        state.set_rendered_values(rendered_values);
        state.execute_templates()?;
        state.apply_overrides(&self.options.overrides);

        tracing::debug!(file = %file, releases = state.releases.len(), "state loaded");
        Ok(state)
    }

    /// Read a state file and fold its bases under it
    async fn read_layers(&self, path: &Path, parent: Option<&Environment>) -> Result<JsonValue> {
        let mut top = self.read_document(path, parent).await?;
        let bases = take_bases(&mut top, path)?;
        if bases.is_empty() {
            return Ok(top);
        }

        let dir = base_dir(path);
        let mut layered = JsonValue::Object(Map::new());
        for base in bases {
            let located = self.locate(&base)?;
            let base_path = resolve(&dir, &located);
            tracing::debug!(base = %base_path.display(), "loading base");

            let mut doc = self.read_document(&base_path, parent).await?;
            if !take_bases(&mut doc, &base_path)?.is_empty() {
                return Err(StateError::NestedBases {
                    file: path.display().to_string(),
                    base,
                });
            }
            merge_append(&mut layered, &doc);
        }
        merge_append(&mut layered, &top);
        Ok(layered)
    }

    async fn read_document(&self, path: &Path, parent: Option<&Environment>) -> Result<JsonValue> {
        let file = path.display().to_string();
        let content = self.fs.read_file(path).map_err(|source| StateError::Read {
            path: file.clone(),
            source,
        })?;

        let content = if is_template_file(path) {
            self.render_state_template(path, &content, parent).await?
        } else {
            content
        };
        document::parse_documents(&file, &content, self.options.strict)
    }

    /// Two-pass rendering of a templated state file.
    ///
    /// The first pass also folds in the bases it declares, so environments
    /// declared only in a base are known to the second pass.
    async fn render_state_template(&self, path: &Path, content: &str, parent: Option<&Environment>) -> Result<String> {
        let file = path.display().to_string();
        let dir = base_dir(path);

        let pre = Renderer::builder(&dir)
            .pre_render(true)
            .file_reader(fs::reader(self.fs.clone()))
            .build();
        let seed = Environment::new(&self.options.environment);
        let data = json!({
            "environment": EnvironmentContext::from(&seed),
            "values": {},
        });
        let first = pre.render_string(&file, content, &data)?;
        let discovered = document::parse_documents(&file, &first, false)
            .map(|top| self.discover_bases(&pre, &data, path, top))
            .and_then(|merged| document::decode(&file, merged))
            .unwrap_or_else(|e| {
                tracing::debug!("{}: pre-render produced no usable document: {}", file, e);
                StateDocument::default()
            });

        let env = self.load_environment(&discovered, &dir, parent).await?;
        let data = json!({
            "environment": EnvironmentContext::from(&env),
            "values": env.merged_values()?,
        });
        Ok(self.renderer(&dir).render_string(&file, content, &data)?)
    }

    /// Layer the pre-rendered bases of `top` under it.
    ///
    /// Bases that cannot be read here are skipped; the full load reports them.
    fn discover_bases(&self, pre: &Renderer, data: &JsonValue, path: &Path, mut top: JsonValue) -> JsonValue {
        let bases = match take_bases(&mut top, path) {
            Ok(bases) if !bases.is_empty() => bases,
            _ => return top,
        };

        let dir = base_dir(path);
        let mut layered = JsonValue::Object(Map::new());
        for base in bases {
            let base_path = match self.locate(&base) {
                Ok(located) => resolve(&dir, &located),
                Err(e) => {
                    tracing::debug!("skipping base {} during discovery: {}", base, e);
                    continue;
                }
            };
            let file = base_path.display().to_string();
            let doc = self
                .fs
                .read_file(&base_path)
                .map_err(|source| StateError::Read {
                    path: file.clone(),
                    source,
                })
                .and_then(|content| {
                    if is_template_file(&base_path) {
                        Ok(pre.render_string(&file, &content, data)?)
                    } else {
                        Ok(content)
                    }
                })
                .and_then(|content| document::parse_documents(&file, &content, false));
            match doc {
                Ok(doc) => merge_append(&mut layered, &doc),
                Err(e) => tracing::debug!("skipping base {} during discovery: {}", file, e),
            }
        }
        merge_append(&mut layered, &top);
        layered
    }

    fn load_lock(&self, document: &StateDocument, dir: &Path) -> Result<Option<ChartLock>> {
        if document.lock_file.is_empty() {
            return Ok(None);
        }
        let path = resolve(dir, &document.lock_file);
        let content = self.fs.read_file(&path).map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(ChartLock::from_yaml(&content)?))
    }

    pub(crate) fn renderer(&self, dir: &Path) -> Renderer {
        Renderer::builder(dir)
            .file_reader(fs::reader(self.fs.clone()))
            .evaluator(self.evaluator.clone())
            .build()
    }

    pub(crate) fn locate(&self, location: &str) -> Result<String> {
        self.remote.locate(location).map_err(|e| StateError::Remote {
            location: location.to_string(),
            message: e.to_string(),
        })
    }
}

fn take_bases(doc: &mut JsonValue, path: &Path) -> Result<Vec<String>> {
    let Some(bases) = doc.as_object_mut().and_then(|m| m.remove("bases")) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(bases).map_err(|e| StateError::Load {
        file: path.display().to_string(),
        index: 0,
        message: format!("bases: {}", e),
    })
}

fn base_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

pub(crate) fn resolve(dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use serde_json::json;

    fn loader(fs: MemoryFileSystem, environment: &str) -> Loader {
        Loader::new(
            Arc::new(fs),
            LoadOptions {
                environment: environment.into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_load_simple_state() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "releases:\n- name: web\n  namespace: apps\n  chart: stable/nginx\n",
        );
        let state = loader(fs, "default").load(Path::new("/work/stackfile.yaml"), None).await.unwrap();
        assert_eq!(state.releases.len(), 1);
        assert_eq!(state.releases[0].id(), "apps/web");
        assert_eq!(state.base_dir, PathBuf::from("/work"));
        assert_eq!(state.env.name, "default");
    }

    #[tokio::test]
    async fn test_bases_layer_under_top_level() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "bases:\n- common.yaml\nreleases:\n- name: web\n  chart: stable/nginx\n",
            )
            .with_file(
                "/work/common.yaml",
                "helmDefaults:\n  wait: true\nreleases:\n- name: ingress\n  chart: stable/ingress\n",
            );
        let state = loader(fs, "default").load(Path::new("/work/stackfile.yaml"), None).await.unwrap();
        let names: Vec<_> = state.releases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ingress", "web"]);
        assert!(state.helm_defaults.wait);
    }

    #[tokio::test]
    async fn test_nested_bases_rejected() {
        let fs = MemoryFileSystem::new()
            .with_file("/work/stackfile.yaml", "bases: [a.yaml]\n")
            .with_file("/work/a.yaml", "bases: [b.yaml]\n")
            .with_file("/work/b.yaml", "releases: []\n");
        let err = loader(fs, "default")
            .load(Path::new("/work/stackfile.yaml"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nested bases are unsupported"));
    }

    #[tokio::test]
    async fn test_templated_state_renders_with_environment() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml.gotmpl",
                "environments:\n  production:\n    values:\n    - replicas: 3\n---\nreleases:\n- name: web-{{ environment.name }}\n  chart: stable/nginx\n  labels:\n    replicas: \"{{ values.replicas }}\"\n",
            );
        let state = loader(fs, "production")
            .load(Path::new("/work/stackfile.yaml.gotmpl"), None)
            .await
            .unwrap();
        assert_eq!(state.releases[0].name, "web-production");
        assert_eq!(state.releases[0].labels["replicas"], "3");
    }

    #[tokio::test]
    async fn test_templated_state_sees_environments_from_bases() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml.gotmpl",
                "bases:\n- envs.yaml\n---\nreleases:\n- name: web-{{ environment.name }}\n  chart: stable/nginx\n  labels:\n    replicas: \"{{ values.replicas }}\"\n",
            )
            .with_file(
                "/work/envs.yaml",
                "environments:\n  production:\n    values:\n    - replicas: 5\n",
            );
        let state = loader(fs, "production")
            .load(Path::new("/work/stackfile.yaml.gotmpl"), None)
            .await
            .unwrap();
        assert_eq!(state.releases[0].name, "web-production");
        assert_eq!(state.releases[0].labels["replicas"], "5");
        assert!(state.environments.contains_key("production"));
    }

    #[tokio::test]
    async fn test_lock_file_pins_versions() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "lockFile: stackfile.lock\nreleases:\n- name: web\n  chart: stable/nginx\n  version: ^1.0\n",
            )
            .with_file(
                "/work/stackfile.lock",
                "version: \"1\"\ndependencies:\n- name: nginx\n  repository: stable\n  version: 1.4.0\ndigest: sha256:00\ngenerated: 2024-01-01T00:00:00Z\n",
            );
        let state = loader(fs, "default").load(Path::new("/work/stackfile.yaml"), None).await.unwrap();
        assert_eq!(state.resolve_version(&state.releases[0]).unwrap(), "1.4.0");
    }

    #[tokio::test]
    async fn test_overrides_apply_after_templating() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "releases:\n- name: web\n  namespace: apps\n  chart: stable/nginx\n",
        );
        let mut options = LoadOptions::default();
        options.overrides.namespace = "ops".into();
        let state = Loader::new(Arc::new(fs), options)
            .load(Path::new("/work/stackfile.yaml"), None)
            .await
            .unwrap();
        assert_eq!(state.releases[0].namespace, "ops");
    }

    #[tokio::test]
    async fn test_state_values_override_environment() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "values:\n- tier: free\nreleases:\n- name: web-{{ values.tier }}\n  chart: stable/nginx\n",
        );
        let mut options = LoadOptions::default();
        options.state_values = json!({"tier": "pro"}).as_object().cloned().unwrap();
        let state = Loader::new(Arc::new(fs), options)
            .load(Path::new("/work/stackfile.yaml"), None)
            .await
            .unwrap();
        assert_eq!(state.releases[0].name, "web-pro");
    }

    #[tokio::test]
    async fn test_missing_state_file() {
        let err = loader(MemoryFileSystem::new(), "default")
            .load(Path::new("/work/stackfile.yaml"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Read { .. }));
    }
}
