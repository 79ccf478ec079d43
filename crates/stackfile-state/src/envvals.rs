//! Environment values: value files, secrets and defaults

use serde_json::{Value as JsonValue, json};
use stackfile_core::environment::DEFAULT_ENVIRONMENT;
use stackfile_core::{Environment, EnvironmentContext, Map, ValuesEntry, deep_merge};
use stackfile_engine::Renderer;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::document::{MissingFileHandler, StateDocument, closest};
use crate::error::{Result, StateError};
use crate::executor::{ExecError, HelmContext};
use crate::loader::{Loader, resolve};
use crate::scatter::scatter_gather;

impl Loader {
    /// Build the environment the state is bound to.
    ///
    /// The declared environment is merged onto `parent` when one is given.
    /// Default values and command-line state values are applied last.
    pub(crate) async fn load_environment(
        &self,
        document: &StateDocument,
        dir: &Path,
        parent: Option<&Environment>,
    ) -> Result<Environment> {
        let name = self.options.environment.as_str();
        let renderer = self.renderer(dir);
        let seed = parent.cloned().unwrap_or_else(|| Environment::new(name));

        let mut env = match document.environments.get(name) {
            Some(spec) => {
                let mut values = self.load_values(
                    &renderer,
                    dir,
                    &spec.values,
                    &seed,
                    ValuesScope::Environment,
                    spec.missing_file_handler,
                )?;
                let secrets = self
                    .load_secrets(&renderer, dir, &spec.secrets, spec.missing_file_handler)
                    .await?;
                merge_map(&mut values, secrets);

                let mut env = Environment::new(name).with_values(values);
                if !spec.kube_context.is_empty() {
                    env.kube_context = Some(spec.kube_context.clone());
                }
                env
            }
            None => {
                let allowed =
                    self.options.allow_undefined_environment || parent.is_some() || name == DEFAULT_ENVIRONMENT;
                if !allowed {
                    return Err(StateError::UndefinedEnvironment {
                        name: name.to_string(),
                        suggestion: closest(name, document.environments.keys().map(String::as_str)),
                    });
                }
                Environment::new(name)
            }
        };

        if let Some(parent) = parent {
            env = parent.merge(Some(&env))?;
        }

        env.defaults = self.load_values(
            &renderer,
            dir,
            &document.values,
            &env,
            ValuesScope::Defaults,
            MissingFileHandler::Error,
        )?;

        if !self.options.state_values.is_empty() {
            merge_map(&mut env.values, self.options.state_values.clone());
        }

        Ok(env)
    }

    /// Merge value entries in declaration order.
    ///
    /// Template files see `environment` (built from `seed`) and the values
    /// merged so far as `values`. While an environment is being declared its
    /// own values grow with each entry; defaults leave them untouched.
    fn load_values(
        &self,
        renderer: &Renderer,
        dir: &Path,
        entries: &[ValuesEntry],
        seed: &Environment,
        scope: ValuesScope,
        handler: MissingFileHandler,
    ) -> Result<Map> {
        let mut merged = Map::new();

        for entry in entries {
            match entry {
                ValuesEntry::Inline(map) => merge_map(&mut merged, map.clone()),
                ValuesEntry::Path(pattern) => {
                    let mut environment = EnvironmentContext::from(seed);
                    if scope == ValuesScope::Environment {
                        merge_map(&mut environment.values, merged.clone());
                    }
                    let data = json!({"environment": environment, "values": merged});

                    for file in self.glob_values(dir, pattern, handler)? {
                        tracing::debug!(file = %file.display(), "loading environment values");
                        let values = renderer.render_values_file(&file, &data)?;
                        merge_map(&mut merged, values);
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Decrypt secret files concurrently, merging them in declaration order
    async fn load_secrets(
        &self,
        renderer: &Renderer,
        dir: &Path,
        secrets: &[String],
        handler: MissingFileHandler,
    ) -> Result<Map> {
        if secrets.is_empty() {
            return Ok(Map::new());
        }
        let executor = self.executor.clone().ok_or_else(|| {
            StateError::Exec(ExecError::new("environment secrets need a command executor to decrypt them"))
        })?;

        let mut files = Vec::new();
        for pattern in secrets {
            files.extend(self.glob_values(dir, pattern, handler)?);
        }

        let count = files.len();
        let workers = if self.options.concurrency == 0 {
            count
        } else {
            self.options.concurrency
        };
        let fs = Arc::clone(&self.fs);

        let decrypted: Vec<Option<Result<(String, String)>>> = scatter_gather(
            workers,
            count,
            |tx| {
                for item in files.into_iter().enumerate() {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            },
            move |worker_index, (index, file): (usize, PathBuf)| {
                let executor = Arc::clone(&executor);
                let fs = Arc::clone(&fs);
                async move {
                    let ctx = HelmContext {
                        worker_index,
                        ..Default::default()
                    };
                    let result = match executor.decrypt_secret(&ctx, &file.display().to_string()).await {
                        Ok(path) => fs
                            .read_file(Path::new(&path))
                            .map(|text| (path.clone(), text))
                            .map_err(|source| StateError::Read { path, source }),
                        Err(e) => Err(StateError::from(e)),
                    };
                    (index, result)
                }
            },
            |results| {
                let mut ordered: Vec<Option<Result<(String, String)>>> = (0..count).map(|_| None).collect();
                for (index, result) in results {
                    ordered[index] = Some(result);
                }
                ordered
            },
        )
        .await;

        let mut merged = Map::new();
        for result in decrypted {
            let (path, text) = result.ok_or_else(|| StateError::invariant("a secret file produced no result"))??;
            merge_map(&mut merged, renderer.parse_values(&path, &text)?);
        }
        Ok(merged)
    }

    /// Locate and expand a values path, applying the missing-file handler
    fn glob_values(&self, dir: &Path, pattern: &str, handler: MissingFileHandler) -> Result<Vec<PathBuf>> {
        let located = self.locate(pattern)?;
        let full = resolve(dir, &located).display().to_string();
        let matches = self.fs.glob(&full).map_err(|source| StateError::Read {
            path: full.clone(),
            source,
        })?;

        if matches.is_empty() {
            let environment = &self.options.environment;
            match handler {
                MissingFileHandler::Error => {
                    return Err(StateError::MissingFile {
                        pattern: full,
                        environment: environment.clone(),
                    });
                }
                MissingFileHandler::Warn => {
                    tracing::warn!("skipping missing values file matching {} in environment {}", full, environment)
                }
                MissingFileHandler::Info => {
                    tracing::info!("skipping missing values file matching {} in environment {}", full, environment)
                }
                MissingFileHandler::Debug => {
                    tracing::debug!("skipping missing values file matching {} in environment {}", full, environment)
                }
            }
        }
        Ok(matches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValuesScope {
    Environment,
    Defaults,
}

fn merge_map(base: &mut Map, overlay: Map) {
    let mut merged = JsonValue::Object(std::mem::take(base));
    deep_merge(&mut merged, &JsonValue::Object(overlay));
    if let JsonValue::Object(map) = merged {
        *base = map;
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StateError;
    use async_trait::async_trait;
    use crate::executor::{CommandExecutor, DiffOutput, ExecResult, HelmContext};
    use crate::document::RepositorySpec;
    use crate::fs::{FileSystem, MemoryFileSystem};
    use crate::loader::{LoadOptions, Loader};
    use serde_json::json;
    use stackfile_core::Environment;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    async fn load(fs: MemoryFileSystem, environment: &str) -> crate::error::Result<crate::HelmState> {
        Loader::new(
            Arc::new(fs),
            LoadOptions {
                environment: environment.into(),
                ..Default::default()
            },
        )
        .load(Path::new("/work/stackfile.yaml"), None)
        .await
    }

    #[tokio::test]
    async fn test_values_files_merge_in_order() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "environments:\n  production:\n    values:\n    - env/common.yaml\n    - env/production.yaml.gotmpl\n    - region: eu\n",
            )
            .with_file("/work/env/common.yaml", "replicas: 1\ndomain: example.com\n")
            .with_file(
                "/work/env/production.yaml.gotmpl",
                "replicas: 3\nhost: \"{{ environment.name }}.{{ values.domain }}\"\n",
            );
        let state = load(fs, "production").await.unwrap();
        let values = state.rendered_values().unwrap();
        assert_eq!(values["replicas"], json!(3));
        assert_eq!(values["host"], json!("production.example.com"));
        assert_eq!(values["region"], json!("eu"));
    }

    #[tokio::test]
    async fn test_glob_matches_sorted() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "environments:\n  default:\n    values:\n    - env/*.yaml\n",
            )
            .with_file("/work/env/b.yaml", "key: b\n")
            .with_file("/work/env/a.yaml", "key: a\nonly_a: true\n");
        let state = load(fs, "default").await.unwrap();
        let values = state.rendered_values().unwrap();
        assert_eq!(values["key"], json!("b"));
        assert_eq!(values["only_a"], json!(true));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error_by_default() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "environments:\n  default:\n    values:\n    - missing.yaml\n",
        );
        let err = load(fs, "default").await.unwrap_err();
        assert!(matches!(err, StateError::MissingFile { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_file_handler_warn() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "environments:\n  default:\n    missingFileHandler: Warn\n    values:\n    - missing.yaml\n",
        );
        assert!(load(fs, "default").await.is_ok());
        assert!(logs_contain("skipping missing values file matching /work/missing.yaml"));
    }

    #[tokio::test]
    async fn test_undefined_environment() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "environments:\n  production: {}\n  staging: {}\n",
        );
        let err = load(fs, "productoin").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "environment \"productoin\" is not defined (did you mean \"production\"?)"
        );
    }

    #[tokio::test]
    async fn test_parent_environment_is_the_base() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "environments:\n  production:\n    kubeContext: prod-cluster\n    values:\n    - replicas: 3\n",
        );
        let parent = Environment::new("production").with_values(
            json!({"replicas": 1, "team": "web"}).as_object().cloned().unwrap(),
        );
        let state = Loader::new(
            Arc::new(fs),
            LoadOptions {
                environment: "production".into(),
                ..Default::default()
            },
        )
        .load(Path::new("/work/stackfile.yaml"), Some(&parent))
        .await
        .unwrap();

        assert_eq!(state.env.values["replicas"], json!(3));
        assert_eq!(state.env.values["team"], json!("web"));
        assert_eq!(state.env.kube_context.as_deref(), Some("prod-cluster"));
        // the parent is left alone
        assert_eq!(parent.values["replicas"], json!(1));
    }

    #[tokio::test]
    async fn test_undefined_environment_allowed_with_parent() {
        let fs = MemoryFileSystem::new().with_file("/work/stackfile.yaml", "releases: []\n");
        let parent = Environment::new("staging");
        let state = Loader::new(
            Arc::new(fs),
            LoadOptions {
                environment: "staging".into(),
                ..Default::default()
            },
        )
        .load(Path::new("/work/stackfile.yaml"), Some(&parent))
        .await
        .unwrap();
        assert_eq!(state.env.name, "staging");
    }

    #[tokio::test]
    async fn test_defaults_are_under_values() {
        let fs = MemoryFileSystem::new().with_file(
            "/work/stackfile.yaml",
            "values:\n- replicas: 1\n  image: nginx\nenvironments:\n  default:\n    values:\n    - replicas: 2\n",
        );
        let state = load(fs, "default").await.unwrap();
        assert_eq!(state.env.defaults["replicas"], json!(1));
        let values = state.rendered_values().unwrap();
        assert_eq!(values["replicas"], json!(2));
        assert_eq!(values["image"], json!("nginx"));
    }

    #[tokio::test]
    async fn test_defaults_see_the_environment_values() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "values:\n- defaults.yaml.gotmpl\nenvironments:\n  production:\n    values:\n    - region: eu\n",
            )
            .with_file("/work/defaults.yaml.gotmpl", "zone: {{ environment.values.region }}-1\n");
        let state = load(fs, "production").await.unwrap();
        assert_eq!(state.env.defaults["zone"], json!("eu-1"));
        assert_eq!(state.env.values["region"], json!("eu"));
        assert!(state.env.values.get("zone").is_none());
        let values = state.rendered_values().unwrap();
        assert_eq!(values["zone"], json!("eu-1"));
        assert_eq!(values["region"], json!("eu"));
    }

    #[tokio::test]
    async fn test_environment_files_see_inherited_and_earlier_values() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "environments:\n  production:\n    values:\n    - replicas: 3\n    - env/owner.yaml.gotmpl\n",
            )
            .with_file(
                "/work/env/owner.yaml.gotmpl",
                "owner: \"{{ environment.values.team }}-{{ environment.values.replicas }}\"\n",
            );
        let parent = Environment::new("production")
            .with_values(json!({"team": "web"}).as_object().cloned().unwrap());
        let state = Loader::new(
            Arc::new(fs),
            LoadOptions {
                environment: "production".into(),
                ..Default::default()
            },
        )
        .load(Path::new("/work/stackfile.yaml"), Some(&parent))
        .await
        .unwrap();
        assert_eq!(state.env.values["owner"], json!("web-3"));
    }

    struct DecryptingExecutor {
        fs: Arc<MemoryFileSystem>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for DecryptingExecutor {
        async fn add_repo(&self, _: &RepositorySpec) -> ExecResult<()> { Ok(()) }
        async fn update_repos(&self) -> ExecResult<()> { Ok(()) }
        async fn build_deps(&self, _: &str, _: &str) -> ExecResult<()> { Ok(()) }
        async fn fetch(&self, chart: &str, _: &[String]) -> ExecResult<String> { Ok(chart.into()) }
        async fn sync_release(&self, _: &HelmContext, _: &str, _: &str, _: &[String]) -> ExecResult<()> { Ok(()) }
        async fn diff_release(&self, _: &HelmContext, _: &str, _: &str, _: &[String]) -> ExecResult<DiffOutput> {
            Ok(DiffOutput::default())
        }
        async fn template_release(&self, _: &str, _: &str, _: &[String]) -> ExecResult<String> { Ok(String::new()) }
        async fn lint(&self, _: &str, _: &str, _: &[String]) -> ExecResult<String> { Ok(String::new()) }
        async fn release_status(&self, _: &HelmContext, _: &str, _: &[String]) -> ExecResult<String> { Ok(String::new()) }
        async fn delete_release(&self, _: &HelmContext, _: &str, _: &[String]) -> ExecResult<()> { Ok(()) }
        async fn test_release(&self, _: &HelmContext, _: &str, _: &[String]) -> ExecResult<String> { Ok(String::new()) }
        async fn list(&self, _: &HelmContext, _: &str, _: &[String]) -> ExecResult<String> { Ok(String::new()) }
        async fn decrypt_secret(&self, _: &HelmContext, path: &str) -> ExecResult<String> {
            self.calls.lock().unwrap().push(path.to_string());
            let content = self.fs.read_file(Path::new(path)).unwrap().replace("ENC[", "").replace(']', "");
            let decrypted = format!("{}.dec", path);
            self.fs.write_file(Path::new(&decrypted), content.as_bytes()).unwrap();
            Ok(decrypted)
        }
        async fn is_helm3(&self) -> bool { true }
        async fn version(&self) -> Option<semver::Version> { None }
    }

    #[tokio::test]
    async fn test_secrets_decrypted_and_merged_in_order() {
        let fs = Arc::new(
            MemoryFileSystem::new()
                .with_file(
                    "/work/stackfile.yaml",
                    "environments:\n  default:\n    values:\n    - password: plain\n    secrets:\n    - secrets/b.yaml\n    - secrets/a.yaml\n",
                )
                .with_file("/work/secrets/a.yaml", "password: ENC[from-a]\n")
                .with_file("/work/secrets/b.yaml", "password: ENC[from-b]\ntoken: ENC[t]\n"),
        );
        let executor = Arc::new(DecryptingExecutor {
            fs: fs.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let state = Loader::new(
            fs,
            LoadOptions {
                concurrency: 2,
                ..Default::default()
            },
        )
        .executor(executor.clone())
        .load(Path::new("/work/stackfile.yaml"), None)
        .await
        .unwrap();

        let values = state.rendered_values().unwrap();
        assert_eq!(values["password"], json!("from-a"));
        assert_eq!(values["token"], json!("t"));
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_secrets_need_an_executor() {
        let fs = MemoryFileSystem::new()
            .with_file(
                "/work/stackfile.yaml",
                "environments:\n  default:\n    secrets:\n    - secrets.yaml\n",
            )
            .with_file("/work/secrets.yaml", "a: b\n");
        assert!(matches!(load(fs, "default").await, Err(StateError::Exec(_))));
    }
}
