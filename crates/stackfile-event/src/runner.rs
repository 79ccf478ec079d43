//! Process runner abstraction

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::RunError;

/// Runs an external command and returns its combined output
#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(
        &self,
        cmd: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> std::result::Result<String, RunError>;
}

/// Runner backed by `tokio::process::Command`
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Working directory; the current one when unset
    pub dir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn execute(
        &self,
        cmd: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> std::result::Result<String, RunError> {
        let mut command = Command::new(cmd);
        command
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        tracing::debug!(command = cmd, ?args, "running");
        let output = command
            .output()
            .await
            .map_err(|e| RunError::new(format!("failed to start: {}", e), ""))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(RunError::new(
                format!("{}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim()),
                combined,
            )
            .with_code(output.status.code()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_success() {
        let out = ShellRunner::default()
            .execute("sh", &["-c".into(), "echo hi; echo err >&2".into()], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, "hi\nerr\n");
    }

    #[tokio::test]
    async fn test_shell_runner_env_and_failure() {
        let mut env = HashMap::new();
        env.insert("HOOK_VALUE".to_string(), "42".to_string());
        let err = ShellRunner::default()
            .execute("sh", &["-c".into(), "echo $HOOK_VALUE; exit 1".into()], &env)
            .await
            .unwrap_err();
        assert_eq!(err.output, "42\n");
        assert_eq!(err.code, Some(1));
    }

    #[tokio::test]
    async fn test_shell_runner_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let out = ShellRunner::new(dir.path())
            .execute("cat", &["marker.txt".into()], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, "here");
    }

    #[tokio::test]
    async fn test_shell_runner_missing_binary() {
        let err = ShellRunner::default()
            .execute("stackfile-no-such-binary", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.message.starts_with("failed to start"));
        assert_eq!(err.code, None);
    }
}
