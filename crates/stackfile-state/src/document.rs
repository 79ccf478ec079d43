//! State file schema and multi-document parsing

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stackfile_core::{Hook, ReleaseSpec, ValuesEntry, cast_keys_to_strings, merge_append};

use crate::error::{Result, StateError};

/// One state file after its documents are merged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<String>,

    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentSpec>,

    #[serde(default)]
    pub helm_defaults: HelmDefaults,

    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,

    #[serde(default)]
    pub releases: Vec<ReleaseSpec>,

    /// Default values, merged under every environment's values
    #[serde(default)]
    pub values: Vec<ValuesEntry>,

    /// Global hooks
    #[serde(default)]
    pub hooks: Vec<Hook>,

    #[serde(default)]
    pub common_labels: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helm_binary: String,

    /// Lock file pinning chart versions, relative to the state file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub values: Vec<ValuesEntry>,

    #[serde(default)]
    pub secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_context: String,

    #[serde(default)]
    pub missing_file_handler: MissingFileHandler,
}

/// What to do when an environment values path matches no file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingFileHandler {
    #[default]
    Error,
    Warn,
    Info,
    Debug,
}

/// Defaults applied to every release that does not set the field itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmDefaults {
    #[serde(default)]
    pub tiller_namespace: String,
    #[serde(default)]
    pub kube_context: String,
    /// Extra arguments passed to every helm call
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub devel: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_for_jobs: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub recreate_pods: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub cleanup_on_fail: bool,
    #[serde(default)]
    pub create_namespace: bool,
    #[serde(default)]
    pub tillerless: bool,
    #[serde(default)]
    pub history_max: Option<u32>,
    #[serde(default)]
    pub disable_validation: bool,
    #[serde(default, rename = "disableOpenAPIValidation")]
    pub disable_openapi_validation: bool,
    #[serde(default)]
    pub skip_deps: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub oci: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,
    #[serde(default)]
    pub pass_credentials: bool,
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "bases",
    "environments",
    "helmDefaults",
    "repositories",
    "releases",
    "values",
    "hooks",
    "commonLabels",
    "helmBinary",
    "lockFile",
];

const RELEASE_KEYS: &[&str] = &[
    "name",
    "chart",
    "version",
    "namespace",
    "kubeContext",
    "tillerNamespace",
    "verify",
    "devel",
    "wait",
    "waitForJobs",
    "timeout",
    "recreatePods",
    "force",
    "installed",
    "atomic",
    "cleanupOnFail",
    "createNamespace",
    "tillerless",
    "disableValidation",
    "disableOpenAPIValidation",
    "skipDeps",
    "historyMax",
    "needs",
    "labels",
    "condition",
    "values",
    "secrets",
    "set",
    "hooks",
    "installedTemplate",
    "waitTemplate",
    "verifyTemplate",
    "tillerlessTemplate",
];

const ENVIRONMENT_KEYS: &[&str] = &["values", "secrets", "kubeContext", "missingFileHandler"];

const HOOK_KEYS: &[&str] = &["name", "events", "command", "args", "showLogs", "kubectlApply"];

/// Parse a multi-document stream into one merged document.
///
/// Documents are merged in order with list-append semantics. Errors carry
/// the 1-based index of the failing document.
pub fn parse_documents(file: &str, content: &str, strict: bool) -> Result<JsonValue> {
    let mut merged = JsonValue::Object(Default::default());

    for (i, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let index = i + 1;
        let load_error = |message: String| StateError::Load {
            file: file.to_string(),
            index,
            message,
        };

        let yaml = serde_yaml::Value::deserialize(document).map_err(|e| load_error(e.to_string()))?;
        let mut doc = cast_keys_to_strings(yaml).map_err(|e| load_error(e.to_string()))?;
        match &doc {
            JsonValue::Null => continue,
            JsonValue::Object(_) => {}
            other => {
                return Err(load_error(format!(
                    "expected a map, got a {}",
                    stackfile_core::values::type_name(other)
                )));
            }
        }

        normalize_legacy_charts(&mut doc, file, index)?;
        if strict {
            validate(&doc, file, index)?;
        }
        StateDocument::deserialize(&doc).map_err(|e| load_error(e.to_string()))?;
        merge_append(&mut merged, &doc);
    }

    Ok(merged)
}

/// Decode a merged document into the typed schema.
///
/// Each document was already checked on its own by [`parse_documents`], so
/// errors here only come from the merge and carry no document index.
pub fn decode(file: &str, value: JsonValue) -> Result<StateDocument> {
    serde_json::from_value(value).map_err(|e| StateError::Load {
        file: file.to_string(),
        index: 0,
        message: e.to_string(),
    })
}

/// `charts` is the legacy spelling of `releases`
fn normalize_legacy_charts(doc: &mut JsonValue, file: &str, index: usize) -> Result<()> {
    let Some(map) = doc.as_object_mut() else {
        return Ok(());
    };
    if !map.contains_key("charts") {
        return Ok(());
    }
    if map.contains_key("releases") {
        return Err(StateError::ConflictingReleaseKeys {
            file: file.to_string(),
            index,
        });
    }
    if let Some(charts) = map.remove("charts") {
        tracing::warn!("{}: `charts` is deprecated, use `releases` instead", file);
        map.insert("releases".into(), charts);
    }
    Ok(())
}

fn validate(doc: &JsonValue, file: &str, index: usize) -> Result<()> {
    check_keys(doc, TOP_LEVEL_KEYS, "the state", file, index)?;

    if let Some(releases) = doc.get("releases").and_then(JsonValue::as_array) {
        for (i, release) in releases.iter().enumerate() {
            let section = format!("releases[{}]", i);
            check_keys(release, RELEASE_KEYS, &section, file, index)?;
            check_hooks(release, &section, file, index)?;
        }
    }

    if let Some(envs) = doc.get("environments").and_then(JsonValue::as_object) {
        for (name, env) in envs {
            check_keys(env, ENVIRONMENT_KEYS, &format!("environments.{}", name), file, index)?;
        }
    }

    check_hooks(doc, "the state", file, index)
}

fn check_hooks(parent: &JsonValue, section: &str, file: &str, index: usize) -> Result<()> {
    if let Some(hooks) = parent.get("hooks").and_then(JsonValue::as_array) {
        for (i, hook) in hooks.iter().enumerate() {
            check_keys(hook, HOOK_KEYS, &format!("{} hooks[{}]", section, i), file, index)?;
        }
    }
    Ok(())
}

fn check_keys(value: &JsonValue, known: &[&str], section: &str, file: &str, index: usize) -> Result<()> {
    let Some(map) = value.as_object() else {
        return Ok(());
    };
    for key in map.keys() {
        if !known.contains(&key.as_str()) {
            return Err(StateError::UnknownField {
                file: file.to_string(),
                index,
                section: section.to_string(),
                field: key.clone(),
                suggestion: closest(key, known.iter().copied()),
            });
        }
    }
    Ok(())
}

/// Closest known name, if any is similar enough
pub(crate) fn closest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(|c| (c, strsim::jaro_winkler(name, c)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c.to_string())
}
