//! Per-release template expansion
//!
//! Release fields may reference each other through `release.*`. Each pass
//! renders the declared fields against the previous pass's result until
//! nothing changes.

use serde_json::{Value as JsonValue, json};
use stackfile_core::{EnvironmentContext, Map, ReleaseContext, ReleaseSpec, SetValue, ValuesEntry, cast_keys_to_strings};
use stackfile_engine::{EngineError, Renderer};

use crate::error::{Result, StateError};
use crate::state::HelmState;

/// Passes before giving up on a release
pub const MAX_ITERATIONS: usize = 6;

impl HelmState {
    /// Expand template expressions in every release, in place.
    ///
    /// Common labels are applied first, so templates can read them.
    pub fn execute_templates(&mut self) -> Result<()> {
        let values = self.rendered_values()?.clone();
        let environment = self.environment_context();
        let renderer = self.renderer();

        let mut rendered = Vec::with_capacity(self.releases.len());
        for spec in &self.releases {
            let mut spec = spec.clone();
            for (k, v) in &self.common_labels {
                spec.labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
            rendered.push(render_release(&renderer, &spec, &environment, &values)?);
        }

        self.releases = rendered;
        Ok(())
    }
}

/// Render one release to its fixed point and settle its boolean templates
pub fn render_release(
    renderer: &Renderer,
    spec: &ReleaseSpec,
    environment: &EnvironmentContext,
    values: &Map,
) -> Result<ReleaseSpec> {
    let mut previous = spec.clone();

    for iteration in 0..MAX_ITERATIONS {
        let data = json!({
            "environment": environment,
            "release": ReleaseContext::from(&previous),
            "values": values,
        });
        let current = FieldRenderer {
            renderer,
            release: &spec.name,
            data: &data,
        }
        .render(spec)?;

        if current == previous {
            tracing::trace!(release = %spec.name, iteration, "templates settled");
            return settle_booleans(current);
        }
        previous = current;
    }

    Err(StateError::RecursiveReferences {
        release: spec.name.clone(),
        iterations: MAX_ITERATIONS,
    })
}

struct FieldRenderer<'a> {
    renderer: &'a Renderer,
    release: &'a str,
    data: &'a JsonValue,
}

impl FieldRenderer<'_> {
    fn render(&self, spec: &ReleaseSpec) -> Result<ReleaseSpec> {
        let mut out = spec.clone();

        out.chart = self.string("chart", &spec.chart)?;
        out.name = self.string("name", &spec.name)?;
        out.namespace = self.string("namespace", &spec.namespace)?;
        out.version = self.string("version", &spec.version)?;
        out.kube_context = self.string("kubeContext", &spec.kube_context)?;

        for (key, value) in out.labels.iter_mut() {
            *value = self.string(&format!("labels.{}", key), value)?;
        }

        out.values = spec
            .values
            .iter()
            .enumerate()
            .map(|(i, entry)| self.values_entry(i, entry))
            .collect::<Result<_>>()?;

        out.secrets = spec
            .secrets
            .iter()
            .enumerate()
            .map(|(i, s)| self.string(&format!("secrets[{}]", i), s))
            .collect::<Result<_>>()?;

        out.set = spec
            .set
            .iter()
            .enumerate()
            .map(|(i, s)| self.set_value(i, s))
            .collect::<Result<_>>()?;

        out.needs = spec
            .needs
            .iter()
            .enumerate()
            .map(|(i, n)| self.string(&format!("needs[{}]", i), n))
            .collect::<Result<_>>()?;

        out.installed_template = self.optional("installedTemplate", &spec.installed_template)?;
        out.wait_template = self.optional("waitTemplate", &spec.wait_template)?;
        out.verify_template = self.optional("verifyTemplate", &spec.verify_template)?;
        out.tillerless_template = self.optional("tillerlessTemplate", &spec.tillerless_template)?;

        Ok(out)
    }

    fn string(&self, field: &str, source: &str) -> Result<String> {
        if !source.contains("{{") && !source.contains("{%") {
            return Ok(source.to_string());
        }
        self.renderer
            .render_string(&format!("{}.{}", self.release, field), source, self.data)
            .map_err(|e| self.error(field, e))
    }

    fn optional(&self, field: &str, source: &Option<String>) -> Result<Option<String>> {
        source.as_deref().map(|s| self.string(field, s)).transpose()
    }

    fn values_entry(&self, index: usize, entry: &ValuesEntry) -> Result<ValuesEntry> {
        let field = format!("values[{}]", index);
        match entry {
            ValuesEntry::Path(path) => Ok(ValuesEntry::Path(self.string(&field, path)?)),
            ValuesEntry::Inline(map) => {
                let text = serde_yaml::to_string(map)
                    .map_err(|e| StateError::invariant(format!("inline values are not serializable: {}", e)))?;
                let rendered = self.string(&field, &text)?;
                if rendered == text {
                    return Ok(entry.clone());
                }
                let yaml: serde_yaml::Value = serde_yaml::from_str(&rendered).map_err(|source| {
                    self.error(
                        &field,
                        EngineError::Yaml {
                            path: format!("{}.{}", self.release, field),
                            source,
                        },
                    )
                })?;
                match cast_keys_to_strings(yaml)? {
                    JsonValue::Object(map) => Ok(ValuesEntry::Inline(map)),
                    JsonValue::Null => Ok(ValuesEntry::Inline(Map::new())),
                    other => Err(self.error(
                        &field,
                        EngineError::NotAMap {
                            path: format!("{}.{}", self.release, field),
                            found: stackfile_core::values::type_name(&other),
                        },
                    )),
                }
            }
        }
    }

    fn set_value(&self, index: usize, set: &SetValue) -> Result<SetValue> {
        let field = |name: &str| format!("set[{}].{}", index, name);
        Ok(SetValue {
            name: self.string(&field("name"), &set.name)?,
            value: self.string(&field("value"), &set.value)?,
            file: self.string(&field("file"), &set.file)?,
            values: set
                .values
                .iter()
                .map(|v| self.string(&field("values"), v))
                .collect::<Result<_>>()?,
        })
    }

    fn error(&self, field: &str, source: EngineError) -> StateError {
        StateError::Template {
            release: self.release.to_string(),
            field: field.to_string(),
            source: Box::new(source),
        }
    }
}

/// Parse `*Template` fields as YAML booleans and clear them
fn settle_booleans(mut spec: ReleaseSpec) -> Result<ReleaseSpec> {
    let name = spec.name.clone();
    let parse = |field: &str, text: Option<String>| -> Result<Option<bool>> {
        let Some(text) = text else { return Ok(None) };
        serde_yaml::from_str::<bool>(text.trim())
            .map(Some)
            .map_err(|_| StateError::InvalidBool {
                release: name.clone(),
                field: field.to_string(),
                value: text.trim().to_string(),
            })
    };

    if let Some(b) = parse("installedTemplate", spec.installed_template.take())? {
        spec.installed = Some(b);
    }
    if let Some(b) = parse("waitTemplate", spec.wait_template.take())? {
        spec.wait = Some(b);
    }
    if let Some(b) = parse("verifyTemplate", spec.verify_template.take())? {
        spec.verify = Some(b);
    }
    if let Some(b) = parse("tillerlessTemplate", spec.tillerless_template.take())? {
        spec.tillerless = Some(b);
    }
    Ok(spec)
}
