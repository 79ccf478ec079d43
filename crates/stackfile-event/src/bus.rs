//! Hook bus
//!
//! Hooks fire in declaration order. The first hook that fails ends the
//! trigger; hooks that already ran are not rolled back.

use serde_json::{Value as JsonValue, json};
use stackfile_core::{EnvironmentContext, Hook, Map};
use stackfile_engine::Renderer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::runner::Runner;

pub struct Bus {
    hooks: Vec<Hook>,
    namespace: String,
    environment: EnvironmentContext,
    state_file: String,
    renderer: Renderer,
    runner: Arc<dyn Runner>,
}

impl Bus {
    pub fn new(
        hooks: Vec<Hook>,
        base_dir: impl Into<PathBuf>,
        environment: EnvironmentContext,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            hooks,
            namespace: String::new(),
            environment,
            state_file: String::new(),
            renderer: Renderer::new(base_dir),
            runner,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// State file path, only used in debug logs
    pub fn state_file(mut self, path: impl Into<String>) -> Self {
        self.state_file = path.into();
        self
    }

    /// Fire every hook listening on `event`.
    ///
    /// `context` entries are added to the template data next to
    /// `environment`, `namespace` and `event`. Returns whether any hook ran.
    pub async fn trigger(&self, event: &str, event_error: Option<&str>, context: &Map) -> Result<bool> {
        let mut executed = false;

        for hook in self.hooks.iter().filter(|h| h.fires_on(event)) {
            let name = if hook.name.is_empty() {
                hook.command.clone()
            } else {
                hook.name.clone()
            };
            tracing::debug!(hook = %name, event, state_file = %self.state_file, "firing hook");

            let (command, args) = resolve_command(hook, &name)?;
            let data = self.template_data(&name, event, event_error, context)?;

            let command = self.render(&name, "command", &command, &data)?;
            let args = args
                .iter()
                .enumerate()
                .map(|(i, arg)| self.render(&name, &format!("args[{}]", i), arg, &data))
                .collect::<Result<Vec<_>>>()?;

            let result = self.runner.execute(&command, &args, &HashMap::new()).await;

            if hook.show_logs {
                let output = match &result {
                    Ok(output) => output.as_str(),
                    Err(e) => e.output.as_str(),
                };
                for line in output.lines() {
                    tracing::info!("hook[{}] {} | {}", name, event, line);
                }
            }

            result.map_err(|source| HookError::CommandFailed {
                hook: name.clone(),
                command: command.clone(),
                source,
            })?;
            executed = true;
        }

        Ok(executed)
    }

    fn template_data(&self, hook: &str, event: &str, event_error: Option<&str>, context: &Map) -> Result<JsonValue> {
        let environment = serde_json::to_value(&self.environment).map_err(|e| HookError::Context {
            hook: hook.to_string(),
            message: format!("environment: {}", e),
        })?;

        let mut data = Map::new();
        data.insert("environment".into(), environment);
        data.insert("namespace".into(), JsonValue::String(self.namespace.clone()));
        data.insert(
            "event".into(),
            json!({"name": event, "error": event_error.unwrap_or_default()}),
        );
        for (k, v) in context {
            data.insert(k.clone(), v.clone());
        }
        Ok(JsonValue::Object(data))
    }

    fn render(&self, hook: &str, field: &str, source: &str, data: &JsonValue) -> Result<String> {
        self.renderer
            .render_string(&format!("hook[{}].{}", hook, field), source, data)
            .map_err(|e| HookError::Render {
                hook: hook.to_string(),
                field: field.to_string(),
                source: Box::new(e),
            })
    }
}

/// Expand the `kubectlApply` shorthand into a command line
fn resolve_command(hook: &Hook, name: &str) -> Result<(String, Vec<String>)> {
    let Some(apply) = &hook.kubectl_apply else {
        return Ok((hook.command.clone(), hook.args.clone()));
    };

    if !hook.command.is_empty() {
        tracing::warn!(
            "hook[{}]: command `{}` is ignored because kubectlApply is set",
            name,
            hook.command
        );
    }

    let filename = apply.filename.as_deref().filter(|s| !s.is_empty());
    let kustomize = apply.kustomize.as_deref().filter(|s| !s.is_empty());
    let (flag, target) = match (filename, kustomize) {
        (Some(f), None) => ("-f", f),
        (None, Some(k)) => ("-k", k),
        (Some(_), Some(_)) => {
            return Err(HookError::InvalidConfig {
                hook: name.to_string(),
                message: "kubectlApply: `filename` and `kustomize` are mutually exclusive".into(),
            });
        }
        (None, None) => {
            return Err(HookError::InvalidConfig {
                hook: name.to_string(),
                message: "kubectlApply: either `filename` or `kustomize` must be set".into(),
            });
        }
    };

    Ok((
        "kubectl".to_string(),
        vec!["apply".to_string(), flag.to_string(), target.to_string()],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use async_trait::async_trait;
    use stackfile_core::KubectlApply;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Runner for RecordingRunner {
        async fn execute(
            &self,
            cmd: &str,
            args: &[String],
            _env: &HashMap<String, String>,
        ) -> std::result::Result<String, RunError> {
            self.calls.lock().unwrap().push((cmd.to_string(), args.to_vec()));
            let output = format!("ran {} {}\nsecond line", cmd, args.join(" "));
            if self.fail_on.as_deref() == Some(cmd) {
                Err(RunError::new("exit status: 1", output))
            } else {
                Ok(output)
            }
        }
    }

    fn hook(name: &str, events: &[&str], command: &str, args: &[&str], show_logs: bool) -> Hook {
        Hook {
            name: name.into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            show_logs,
            kubectl_apply: None,
        }
    }

    fn bus(hooks: Vec<Hook>, runner: Arc<RecordingRunner>) -> Bus {
        let env = EnvironmentContext {
            name: "production".into(),
            ..Default::default()
        };
        Bus::new(hooks, "/work", env, runner).namespace("apps")
    }

    #[tokio::test]
    async fn test_renders_command_and_args() {
        let runner = Arc::new(RecordingRunner::default());
        let bus = bus(
            vec![hook(
                "notify",
                &["presync"],
                "echo",
                &["{{ environment.name }}", "{{ namespace }}", "{{ event.name }}", "{{ release.name }}"],
                false,
            )],
            runner.clone(),
        );

        let mut context = Map::new();
        context.insert("release".into(), json!({"name": "web"}));
        assert!(bus.trigger("presync", None, &context).await.unwrap());

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            ("echo".to_string(), vec!["production".into(), "apps".into(), "presync".into(), "web".into()])
        );
    }

    #[tokio::test]
    async fn test_environment_values_reach_hooks() {
        let runner = Arc::new(RecordingRunner::default());
        let env = EnvironmentContext {
            name: "production".into(),
            kube_context: "prod-cluster".into(),
            values: json!({"region": "eu"}).as_object().cloned().unwrap(),
        };
        let bus = Bus::new(
            vec![hook(
                "ctx",
                &["prepare"],
                "echo",
                &["{{ environment.kube_context }}", "{{ environment.values.region }}"],
                false,
            )],
            "/work",
            env,
            runner.clone(),
        );

        bus.trigger("prepare", None, &Map::new()).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap()[0].1, vec!["prod-cluster".to_string(), "eu".to_string()]);
    }

    #[tokio::test]
    async fn test_only_matching_events_fire() {
        let runner = Arc::new(RecordingRunner::default());
        let bus = bus(vec![hook("a", &["cleanup"], "true", &[], false)], runner.clone());

        assert!(!bus.trigger("presync", None, &Map::new()).await.unwrap());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_error_is_exposed() {
        let runner = Arc::new(RecordingRunner::default());
        let bus = bus(
            vec![hook("a", &["postsync"], "echo", &["{{ event.error }}"], false)],
            runner.clone(),
        );
        bus.trigger("postsync", Some("boom"), &Map::new()).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap()[0].1, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_names_hook_and_command_and_stops() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("false".into()),
            ..Default::default()
        });
        let bus = bus(
            vec![
                hook("first", &["presync"], "true", &[], false),
                hook("broken", &["presync"], "false", &[], false),
                hook("never", &["presync"], "echo", &[], false),
            ],
            runner.clone(),
        );

        let err = bus.trigger("presync", None, &Map::new()).await.unwrap_err();
        assert!(err.to_string().starts_with("hook[broken]: command `false` failed"));
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_names_hook() {
        let runner = Arc::new(RecordingRunner::default());
        let bus = bus(
            vec![hook("bad", &["presync"], "echo", &["{{ release.missing }}"], false)],
            runner.clone(),
        );
        let err = bus.trigger("presync", None, &Map::new()).await.unwrap_err();
        assert!(matches!(err, HookError::Render { ref hook, ref field, .. } if hook == "bad" && field == "args[0]"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kubectl_apply_shorthand() {
        let runner = Arc::new(RecordingRunner::default());
        let mut h = hook("apply", &["prepare"], "ignored", &[], false);
        h.kubectl_apply = Some(KubectlApply {
            filename: Some("manifests/{{ environment.name }}.yaml".into()),
            kustomize: None,
        });
        bus(vec![h], runner.clone()).trigger("prepare", None, &Map::new()).await.unwrap();

        assert_eq!(
            runner.calls.lock().unwrap()[0],
            (
                "kubectl".to_string(),
                vec!["apply".into(), "-f".into(), "manifests/production.yaml".into()]
            )
        );
    }

    #[tokio::test]
    async fn test_kubectl_apply_requires_exactly_one_target() {
        let runner = Arc::new(RecordingRunner::default());
        let mut both = hook("both", &["prepare"], "", &[], false);
        both.kubectl_apply = Some(KubectlApply {
            filename: Some("a".into()),
            kustomize: Some("b".into()),
        });
        let err = bus(vec![both], runner.clone()).trigger("prepare", None, &Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let mut neither = hook("neither", &["prepare"], "", &[], false);
        neither.kubectl_apply = Some(KubectlApply::default());
        let err = bus(vec![neither], runner).trigger("prepare", None, &Map::new()).await.unwrap_err();
        assert!(matches!(err, HookError::InvalidConfig { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_show_logs_emits_each_line() {
        let runner = Arc::new(RecordingRunner::default());
        bus(vec![hook("loud", &["presync"], "echo", &["x"], true)], runner)
            .trigger("presync", None, &Map::new())
            .await
            .unwrap();

        assert!(logs_contain("hook[loud] presync | ran echo x"));
        assert!(logs_contain("hook[loud] presync | second line"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hidden_logs_never_emit_output() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("false".into()),
            ..Default::default()
        });
        let quiet = bus(
            vec![
                hook("quiet", &["presync"], "echo", &["x"], false),
                hook("quiet-fail", &["presync"], "false", &[], false),
            ],
            runner,
        );
        assert!(quiet.trigger("presync", None, &Map::new()).await.is_err());

        assert!(!logs_contain("ran echo"));
        assert!(!logs_contain("ran false"));
        assert!(!logs_contain("second line"));
    }
}
