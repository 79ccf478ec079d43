//! Binding between a loaded state and the hook bus

use serde_json::{Value as JsonValue, json};
use stackfile_core::{Map, ReleaseContext, ReleaseSpec};
use stackfile_event::{Bus, Runner};
use std::sync::Arc;

use crate::error::Result;
use crate::state::HelmState;

/// Fires global and per-release hooks for one command.
///
/// Cheap to clone; worker tasks each carry their own copy.
#[derive(Clone)]
pub struct Hooks {
    state: Arc<HelmState>,
    runner: Arc<dyn Runner>,
    command: &'static str,
}

impl Hooks {
    pub fn new(state: Arc<HelmState>, runner: Arc<dyn Runner>, command: &'static str) -> Self {
        Self { state, runner, command }
    }

    /// Fire the state's own hooks
    pub async fn fire_global(&self, event: &str) -> Result<bool> {
        if !self.state.hooks.iter().any(|h| h.fires_on(event)) {
            return Ok(false);
        }
        let bus = self.bus(self.state.hooks.clone(), "");
        Ok(bus.trigger(event, None, &self.context(None)?).await?)
    }

    /// Fire the hooks declared on one release
    pub async fn fire_release(&self, spec: &ReleaseSpec, event: &str, event_error: Option<&str>) -> Result<bool> {
        if !spec.hooks.iter().any(|h| h.fires_on(event)) {
            return Ok(false);
        }
        let bus = self.bus(spec.hooks.clone(), &spec.namespace);
        Ok(bus.trigger(event, event_error, &self.context(Some(spec))?).await?)
    }

    fn bus(&self, hooks: Vec<stackfile_core::Hook>, namespace: &str) -> Bus {
        Bus::new(
            hooks,
            &self.state.base_dir,
            self.state.environment_context(),
            self.runner.clone(),
        )
        .namespace(namespace)
        .state_file(self.state.file_path.display().to_string())
    }

    fn context(&self, spec: Option<&ReleaseSpec>) -> Result<Map> {
        let mut context = Map::new();
        context.insert("values".into(), JsonValue::Object(self.state.rendered_values()?.clone()));
        context.insert("command".into(), json!(self.command));
        if let Some(spec) = spec {
            context.insert("release".into(), json!(ReleaseContext::from(spec)));
        }
        Ok(context)
    }
}
