//! Test doubles for the executor and the hook runner

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use stackfile_event::{RunError, Runner};

use crate::document::RepositorySpec;
use crate::executor::{CommandExecutor, DiffOutput, ExecError, ExecResult, HelmContext};

/// Executor that records every call as `"<operation> <args...>"`
#[derive(Default)]
pub struct RecordingExecutor {
    pub helm2: bool,
    /// Release names whose calls fail
    pub failing: HashSet<String>,
    /// Release names whose diff reports changes
    pub changed: HashSet<String>,
    /// Release names `list` reports as installed
    pub installed: HashSet<String>,
    /// Per-release delay, to shuffle completion order
    pub delays: HashMap<String, u64>,
    pub(crate) calls: Mutex<Vec<String>>,
    /// Calls in progress and the highest count seen, per operation
    pub(crate) in_flight: Mutex<HashMap<String, (usize, usize)>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .collect()
    }

    /// Most calls of `operation` that were ever running at the same time
    pub fn peak(&self, operation: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(operation)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }

    async fn record(&self, operation: &str, name: &str, rest: &[&str]) -> ExecResult<()> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let (now, peak) = in_flight.entry(operation.to_string()).or_default();
            *now += 1;
            *peak = (*peak).max(*now);
        }
        if let Some(ms) = self.delays.get(name) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        } else {
            tokio::task::yield_now().await;
        }
        if let Some((now, _)) = self.in_flight.lock().unwrap().get_mut(operation) {
            *now -= 1;
        }

        let mut call = vec![operation, name];
        call.extend(rest.iter().copied().filter(|s| !s.is_empty()));
        self.calls.lock().unwrap().push(call.join(" "));
        if self.failing.contains(name) {
            return Err(ExecError::new(format!("{} {} failed", operation, name)));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn add_repo(&self, repo: &RepositorySpec) -> ExecResult<()> {
        self.record("add_repo", &repo.name, &[&repo.url]).await
    }

    async fn update_repos(&self) -> ExecResult<()> {
        self.record("update_repos", "", &[]).await
    }

    async fn build_deps(&self, _name: &str, chart: &str) -> ExecResult<()> {
        self.record("build_deps", chart, &[]).await
    }

    async fn fetch(&self, chart: &str, flags: &[String]) -> ExecResult<String> {
        self.record("fetch", chart, &[&flags.join(" ")]).await?;
        let name = chart.rsplit('/').next().unwrap_or(chart);
        Ok(format!("/tmp/charts/{}", name))
    }

    async fn sync_release(&self, _ctx: &HelmContext, name: &str, chart: &str, flags: &[String]) -> ExecResult<()> {
        self.record("sync", name, &[chart, &flags.join(" ")]).await
    }

    async fn diff_release(
        &self,
        _ctx: &HelmContext,
        name: &str,
        chart: &str,
        flags: &[String],
    ) -> ExecResult<DiffOutput> {
        self.record("diff", name, &[chart, &flags.join(" ")]).await?;
        let changed = self.changed.contains(name);
        Ok(DiffOutput {
            output: if changed { format!("{} has changes", name) } else { String::new() },
            changed,
        })
    }

    async fn template_release(&self, name: &str, chart: &str, flags: &[String]) -> ExecResult<String> {
        self.record("template", name, &[chart, &flags.join(" ")]).await?;
        Ok(format!("# manifests of {}\n", name))
    }

    async fn lint(&self, name: &str, chart: &str, flags: &[String]) -> ExecResult<String> {
        self.record("lint", name, &[chart, &flags.join(" ")]).await?;
        Ok(format!("{}: 1 chart(s) linted, 0 chart(s) failed", name))
    }

    async fn release_status(&self, _ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String> {
        self.record("status", name, &[&flags.join(" ")]).await?;
        Ok(format!("STATUS: deployed ({})", name))
    }

    async fn delete_release(&self, _ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<()> {
        self.record("delete", name, &[&flags.join(" ")]).await
    }

    async fn test_release(&self, _ctx: &HelmContext, name: &str, flags: &[String]) -> ExecResult<String> {
        self.record("test", name, &[&flags.join(" ")]).await?;
        Ok(format!("{} tests passed", name))
    }

    async fn list(&self, _ctx: &HelmContext, filter: &str, _flags: &[String]) -> ExecResult<String> {
        let name = filter.trim_start_matches('^').trim_end_matches('$');
        self.record("list", name, &[]).await?;
        Ok(if self.installed.contains(name) { name.to_string() } else { String::new() })
    }

    async fn decrypt_secret(&self, _ctx: &HelmContext, path: &str) -> ExecResult<String> {
        self.record("decrypt", path, &[]).await?;
        Ok(format!("{}.dec", path))
    }

    async fn is_helm3(&self) -> bool {
        !self.helm2
    }

    async fn version(&self) -> Option<semver::Version> {
        Some(if self.helm2 {
            semver::Version::new(2, 17, 0)
        } else {
            semver::Version::new(3, 14, 0)
        })
    }
}

/// Hook runner that records commands and fails on request
#[derive(Default)]
pub struct RecordingRunner {
    pub failing: HashSet<String>,
    pub(crate) calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runner for RecordingRunner {
    async fn execute(&self, cmd: &str, args: &[String], _env: &HashMap<String, String>) -> Result<String, RunError> {
        let mut call = vec![cmd.to_string()];
        call.extend(args.iter().cloned());
        let call = call.join(" ");
        self.calls.lock().unwrap().push(call.clone());
        if self.failing.contains(cmd) {
            return Err(RunError::new("exit status: 1", call));
        }
        Ok(call)
    }
}
