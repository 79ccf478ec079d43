//! Helm command-line flags for one release

use sha2::{Digest, Sha256};
use stackfile_core::{ReleaseSpec, ValuesEntry};
use std::path::{Path, PathBuf};

use crate::error::{Result, StateError};
use crate::executor::CommandExecutor;
use crate::fs::FileSystem;
use crate::state::HelmState;

/// Flags plus the temporary files they point at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseFlags {
    pub flags: Vec<String>,
    pub temp_files: Vec<PathBuf>,
}

impl ReleaseFlags {
    fn push(&mut self, flag: &str) {
        self.flags.push(flag.to_string());
    }

    fn push_value(&mut self, flag: &str, value: impl Into<String>) {
        self.flags.push(flag.to_string());
        self.flags.push(value.into());
    }

    fn toggle(&mut self, flag: &str, release: Option<bool>, default: bool) {
        if release.unwrap_or(default) {
            self.push(flag);
        }
    }
}

pub struct FlagBuilder<'a> {
    state: &'a HelmState,
    executor: &'a dyn CommandExecutor,
    worker_index: usize,
    helm3: bool,
}

impl<'a> FlagBuilder<'a> {
    pub async fn new(state: &'a HelmState, executor: &'a dyn CommandExecutor, worker_index: usize) -> Self {
        Self {
            state,
            executor,
            worker_index,
            helm3: executor.is_helm3().await,
        }
    }

    pub async fn upgrade(&self, spec: &ReleaseSpec) -> Result<ReleaseFlags> {
        let defaults = &self.state.helm_defaults;
        let helm3 = self.helm3;
        let mut flags = ReleaseFlags::default();

        self.version(spec, &mut flags)?;
        flags.toggle("--verify", spec.verify, defaults.verify);
        flags.toggle("--wait", spec.wait, defaults.wait);
        flags.toggle("--wait-for-jobs", spec.wait_for_jobs, defaults.wait_for_jobs);
        self.timeout(spec, &mut flags);
        flags.toggle("--recreate-pods", spec.recreate_pods, defaults.recreate_pods);
        flags.toggle("--force", spec.force, defaults.force);
        flags.toggle("--atomic", spec.atomic, defaults.atomic);
        flags.toggle("--cleanup-on-fail", spec.cleanup_on_fail, defaults.cleanup_on_fail);
        flags.toggle(
            "--disable-openapi-validation",
            spec.disable_openapi_validation,
            defaults.disable_openapi_validation,
        );
        if helm3 {
            flags.toggle("--create-namespace", spec.create_namespace, defaults.create_namespace);
            if let Some(max) = spec.history_max.or(defaults.history_max) {
                flags.push_value("--history-max", max.to_string());
            }
        }

        self.connection(spec, &mut flags);
        self.namespace_and_values(spec, &mut flags).await?;
        Ok(flags)
    }

    pub async fn diff(&self, spec: &ReleaseSpec) -> Result<ReleaseFlags> {
        let defaults = &self.state.helm_defaults;
        let mut flags = ReleaseFlags::default();

        self.version(spec, &mut flags)?;
        flags.toggle("--disable-validation", spec.disable_validation, defaults.disable_validation);
        flags.toggle(
            "--disable-openapi-validation",
            spec.disable_openapi_validation,
            defaults.disable_openapi_validation,
        );
        self.connection(spec, &mut flags);
        self.namespace_and_values(spec, &mut flags).await?;
        Ok(flags)
    }

    pub async fn template(&self, spec: &ReleaseSpec) -> Result<ReleaseFlags> {
        let mut flags = ReleaseFlags::default();
        self.version(spec, &mut flags)?;
        flags.flags.extend(self.state.helm_defaults.args.iter().cloned());
        self.namespace_and_values(spec, &mut flags).await?;
        Ok(flags)
    }

    pub async fn lint(&self, spec: &ReleaseSpec) -> Result<ReleaseFlags> {
        let mut flags = ReleaseFlags::default();
        self.namespace_and_values(spec, &mut flags).await?;
        Ok(flags)
    }

    pub fn delete(&self, spec: &ReleaseSpec) -> Vec<String> {
        let mut flags = ReleaseFlags::default();
        self.connection(spec, &mut flags);
        if self.helm3 {
            if !spec.namespace.is_empty() {
                flags.push_value("--namespace", spec.namespace.clone());
            }
        } else {
            flags.push("--purge");
        }
        flags.flags
    }

    pub fn status(&self, spec: &ReleaseSpec) -> Vec<String> {
        let mut flags = ReleaseFlags::default();
        self.connection(spec, &mut flags);
        if self.helm3 && !spec.namespace.is_empty() {
            flags.push_value("--namespace", spec.namespace.clone());
        }
        flags.flags
    }

    pub fn test(&self, spec: &ReleaseSpec, cleanup: bool) -> Vec<String> {
        let mut flags = ReleaseFlags::default();
        self.timeout(spec, &mut flags);
        if cleanup && !self.helm3 {
            flags.push("--cleanup");
        }
        flags.flags.extend(self.status(spec));
        flags.flags
    }

    fn version(&self, spec: &ReleaseSpec, flags: &mut ReleaseFlags) -> Result<()> {
        let version = self.state.resolve_version(spec)?;
        if !version.is_empty() {
            flags.push_value("--version", version);
        }
        flags.toggle("--devel", spec.devel, self.state.helm_defaults.devel);
        Ok(())
    }

    fn timeout(&self, spec: &ReleaseSpec, flags: &mut ReleaseFlags) {
        if let Some(timeout) = spec.timeout.or(self.state.helm_defaults.timeout) {
            if self.helm3 {
                flags.push_value("--timeout", format!("{}s", timeout));
            } else {
                flags.push_value("--timeout", timeout.to_string());
            }
        }
    }

    /// Kube context, tiller namespace and the default extra args
    fn connection(&self, spec: &ReleaseSpec, flags: &mut ReleaseFlags) {
        let context = self.state.kube_context_for(spec);
        if !context.is_empty() {
            flags.push_value("--kube-context", context);
        }
        if !self.helm3 {
            let ctx = self.state.helm_context(spec, self.worker_index);
            if !ctx.tillerless && !ctx.tiller_namespace.is_empty() {
                flags.push_value("--tiller-namespace", ctx.tiller_namespace);
            }
        }
        flags.flags.extend(self.state.helm_defaults.args.iter().cloned());
    }

    async fn namespace_and_values(&self, spec: &ReleaseSpec, flags: &mut ReleaseFlags) -> Result<()> {
        if !spec.namespace.is_empty() {
            flags.push_value("--namespace", spec.namespace.clone());
        }

        let renderer = self.state.renderer();
        let data = self.state.release_template_data(spec)?;
        let fs = self.state.fs();

        for (index, entry) in spec.values.iter().enumerate() {
            let values = match entry {
                ValuesEntry::Path(path) => {
                    let full = self.state.resolve(path);
                    if !fs.file_exists(&full) {
                        return Err(StateError::Read {
                            path: full.display().to_string(),
                            source: std::io::Error::new(std::io::ErrorKind::NotFound, "values file does not exist"),
                        });
                    }
                    renderer.render_values_file(&full, &data)?
                }
                ValuesEntry::Inline(map) => renderer.expand_refs(map.clone())?,
            };
            let text = serde_yaml::to_string(&values)
                .map_err(|e| StateError::invariant(format!("values are not serializable: {}", e)))?;
            let path = write_temp(fs.as_ref(), &spec.id(), index, &text)?;
            flags.push_value("--values", path.display().to_string());
            flags.temp_files.push(path);
        }

        let ctx = self.state.helm_context(spec, self.worker_index);
        for secret in &spec.secrets {
            let full = self.state.resolve(secret);
            let decrypted = self.executor.decrypt_secret(&ctx, &full.display().to_string()).await?;
            flags.push_value("--values", decrypted.clone());
            flags.temp_files.push(PathBuf::from(decrypted));
        }

        for set in &spec.set {
            if !set.value.is_empty() {
                flags.push_value("--set", format!("{}={}", set.name, set.value));
            } else if !set.file.is_empty() {
                let file = self.state.resolve(&set.file);
                flags.push_value("--set-file", format!("{}={}", set.name, file.display()));
            } else if !set.values.is_empty() {
                flags.push_value("--set", format!("{}={{{}}}", set.name, set.values.join(",")));
            }
        }

        Ok(())
    }
}

/// Write rendered values to a file named after the release and content
fn write_temp(fs: &dyn FileSystem, id: &str, index: usize, content: &str) -> Result<PathBuf> {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(content.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let safe_id: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = std::env::temp_dir().join(format!("stackfile-{}-values-{}.yaml", safe_id, &digest[..12]));

    fs.write_file(&path, content.as_bytes())
        .map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
    Ok(path)
}

/// Remove temporary files, logging the ones that cannot be removed
pub fn cleanup(fs: &dyn FileSystem, files: &[PathBuf]) {
    for file in files {
        if let Err(e) = fs.remove_file(file) {
            tracing::warn!("failed to remove temporary file {}: {}", file.display(), e);
        }
    }
}

/// Whether `path` is one of our temporary values files
pub fn is_temp_values_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("stackfile-") && n.contains("-values-"))
}
