//! Command executor backed by the helm binary

use async_trait::async_trait;
use stackfile_event::{RunError, Runner};
use stackfile_state::{CommandExecutor, DiffOutput, ExecError, ExecResult, HelmContext, RepositorySpec};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Exit code of `helm diff --detailed-exitcode` when something changed
const DIFF_CHANGED: i32 = 2;

pub struct HelmExecutor {
    helm: String,
    runner: Arc<dyn Runner>,
    /// Where remote charts are unpacked for lint
    chart_dir: PathBuf,
    version: OnceCell<Option<semver::Version>>,
}

impl HelmExecutor {
    pub fn new(helm: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        Self {
            helm: helm.into(),
            runner,
            chart_dir: std::env::temp_dir().join("stackfile-charts"),
            version: OnceCell::new(),
        }
    }

    async fn exec(&self, ctx: Option<&HelmContext>, args: Vec<String>) -> ExecResult<String> {
        let wrap = match ctx {
            Some(ctx) if ctx.tillerless => !self.is_helm3().await,
            _ => false,
        };
        let mut env = HashMap::new();
        let (cmd, args) = match ctx {
            Some(ctx) if wrap => {
                env.insert("HELM_TILLER_SILENT".to_string(), "true".to_string());
                let mut wrapped = vec!["tiller".to_string(), "run".to_string()];
                if !ctx.tiller_namespace.is_empty() {
                    wrapped.push(ctx.tiller_namespace.clone());
                }
                wrapped.push("--".to_string());
                wrapped.push(self.helm.clone());
                wrapped.extend(args);
                (self.helm.as_str(), wrapped)
            }
            _ => (self.helm.as_str(), args),
        };

        tracing::debug!("exec: {} {}", cmd, args.join(" "));
        self.runner.execute(cmd, &args, &env).await.map_err(into_exec_error)
    }

    /// Like `exec`, but keeps the exit code of a failed run
    async fn exec_raw(&self, ctx: Option<&HelmContext>, args: Vec<String>) -> std::result::Result<String, RunError> {
        match ctx {
            // The tiller plugin does not forward the exit code of the wrapped helm
            Some(ctx) if ctx.tillerless && !self.is_helm3().await => self
                .exec(Some(ctx), args)
                .await
                .map_err(|e| RunError::new(e.message, e.output)),
            _ => {
                tracing::debug!("exec: {} {}", self.helm, args.join(" "));
                self.runner.execute(&self.helm, &args, &HashMap::new()).await
            }
        }
    }
}

fn into_exec_error(err: RunError) -> ExecError {
    ExecError::new(err.message).with_output(err.output)
}

fn args(parts: &[&str], flags: &[String]) -> Vec<String> {
    parts
        .iter()
        .map(|s| s.to_string())
        .chain(flags.iter().cloned())
        .collect()
}

/// Parse `helm version --short` output such as `v3.14.0+g3fc9f4b`
fn parse_version(output: &str) -> Option<semver::Version> {
    let line = output.lines().find(|l| !l.trim().is_empty())?.trim();
    // helm 2 prints `Client: v2.17.0+ga690bad`
    let raw = line.rsplit(' ').next()?.trim_start_matches('v');
    let raw = raw.split('+').next()?;
    semver::Version::parse(raw).ok()
}

#[async_trait]
impl CommandExecutor for HelmExecutor {
    async fn add_repo(&self, repo: &RepositorySpec) -> ExecResult<()> {
        if repo.oci {
            if repo.username.is_empty() {
                return Ok(());
            }
            let host = repo.url.trim_start_matches("oci://");
            let host = host.split('/').next().unwrap_or(host);
            self.exec(
                None,
                args(
                    &["registry", "login", host, "--username", &repo.username, "--password", &repo.password],
                    &[],
                ),
            ).await?;
            return Ok(());
        }

        let mut flags = Vec::new();
        let mut push = |flag: &str, value: &str| {
            if !value.is_empty() {
                flags.push(flag.to_string());
                flags.push(value.to_string());
            }
        };
        push("--username", &repo.username);
        push("--password", &repo.password);
        push("--ca-file", &repo.ca_file);
        push("--cert-file", &repo.cert_file);
        push("--key-file", &repo.key_file);
        if repo.pass_credentials {
            flags.push("--pass-credentials".to_string());
        }
        tracing::info!("adding repo {} {}", repo.name, repo.url);
        self.exec(None, args(&["repo", "add", &repo.name, &repo.url, "--force-update"], &flags)).await?;
        Ok(())
    }

    async fn update_repos(&self) -> ExecResult<()> {
        self.exec(None, args(&["repo", "update"], &[])).await?;
        Ok(())
    }

    async fn build_deps(&self, _name: &str, chart: &str) -> ExecResult<()> {
        self.exec(None, args(&["dependency", "build", chart], &[])).await?;
        Ok(())
    }

    async fn fetch(&self, chart: &str, flags: &[String]) -> ExecResult<String> {
        let name = chart.trim_end_matches('/').rsplit('/').next().unwrap_or(chart);
        let dir = self.chart_dir.join(chart.replace(['/', ':'], "_"));
        let dir_str = dir.display().to_string();
        let pull = if self.is_helm3().await { "pull" } else { "fetch" };
        self.exec(None, args(&[pull, chart, "--untar", "--untardir", &dir_str], flags)).await?;
        Ok(dir.join(name).display().to_string())
    }

    async fn sync_release(&self, ctx: &HelmContext, name: &str, chart: &str, flags: &[String]) -> ExecResult<()> {
        self.exec(Some(ctx), args(&["upgrade", "--install", name, chart], flags)).await?;
        Ok(())
    }

    async fn diff_release(&self, ctx: &HelmContext, name: &str, chart: &str, flags: &[String]) -> ExecResult<DiffOutput> {
        let diff_args = args(
            &["diff", "upgrade", "--allow-unreleased", "--detailed-exitcode", name, chart],
            flags,
        );
        match self.exec_raw(Some(ctx), diff_args).await {
            Ok(output) => Ok(DiffOutput {
                output,
                changed: false,
            }),
            Err(err) if err.code == Some(DIFF_CHANGED) => Ok(DiffOutput {
                output: err.output,
                changed: true,
            }),
            Err(err) => Err(into_exec_error(err)),
        }
    }

    async fn template_release(&self, name: &str, chart: &str, flags: &[String]) -> ExecResult<String> {
        if self.is_helm3().await {
            self.exec(None, args(&["template", name, chart], flags)).await
        } else {
            self.exec(None, args(&["template", chart, "--name", name], flags)).await
        }
    }

    async fn lint(&self, _name: &str, chart: &str, flags: &[String]) -> ExecResult<String> {
        self.exec(None, args(&["lint", chart], flags)).await
    }

    async fn release_status(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String> {
        self.exec(Some(ctx), args(&["status", name], flags)).await
    }

    async fn delete_release(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<()> {
        let delete = if self.is_helm3().await { "uninstall" } else { "delete" };
        self.exec(Some(ctx), args(&[delete, name], flags)).await?;
        Ok(())
    }

    async fn test_release(&self, ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String> {
        self.exec(Some(ctx), args(&["test", name], flags)).await
    }

    async fn list(&self, ctx: &HelmContext, filter: &str, flags: &[String]) -> ExecResult<String> {
        self.exec(Some(ctx), args(&["list", "--filter", filter, "--short"], flags)).await
    }

    async fn decrypt_secret(&self, _ctx: &HelmContext, path: &str) -> ExecResult<String> {
        tracing::info!("decrypting secret {}", path);
        self.exec(None, args(&["secrets", "dec", path], &[])).await?;
        Ok(format!("{}.dec", path))
    }

    async fn is_helm3(&self) -> bool {
        self.version().await.is_none_or(|v| v.major >= 3)
    }

    async fn version(&self) -> Option<semver::Version> {
        self.version
            .get_or_init(|| async {
                let output = self
                    .runner
                    .execute(&self.helm, &["version".to_string(), "--short".to_string()], &HashMap::new())
                    .await
                    .ok()?;
                parse_version(&output)
            })
            .await
            .clone()
    }
}
