//! Release declarations

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::hook::Hook;
use crate::values::Map;

/// One deployable unit as declared in a state file
///
/// Toggles are tri-state: `None` defers to the state's helm defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    pub name: String,

    /// Local path, `repo/chart` reference or remote URL
    #[serde(default)]
    pub chart: String,

    /// Exact version or semver constraint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_context: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tiller_namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_jobs: Option<bool>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recreate_pods: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atomic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_on_fail: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_namespace: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tillerless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_validation: Option<bool>,
    #[serde(
        default,
        rename = "disableOpenAPIValidation",
        skip_serializing_if = "Option::is_none"
    )]
    pub disable_openapi_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_deps: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_max: Option<u32>,

    /// Other releases that must complete first, by id or short name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,

    /// `<key>.enabled`, looked up in the rendered values
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ValuesEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<SetValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,

    // Template-only mirrors of boolean fields. Cleared once rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tillerless_template: Option<String>,
}

/// A `values:` entry: a file reference or an inline map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValuesEntry {
    Path(String),
    Inline(Map),
}

/// A `set:` entry, mapped to `--set`/`--set-file`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ReleaseSpec {
    pub fn new(name: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
            ..Default::default()
        }
    }

    /// Deterministic identity: `[ctx/][ns/]name`, or `ctx//name` when only
    /// the context is known, so that empty parts never collide.
    pub fn id(&self) -> String {
        let mut id = String::new();
        let ns = if self.tiller_namespace.is_empty() {
            &self.namespace
        } else {
            &self.tiller_namespace
        };

        if !self.kube_context.is_empty() {
            id.push_str(&self.kube_context);
            id.push('/');
        }
        if !ns.is_empty() {
            id.push_str(ns);
            id.push('/');
        } else if !self.kube_context.is_empty() {
            id.push('/');
        }
        id.push_str(&self.name);
        id
    }

    /// Last path segment of the chart reference
    pub fn chart_name(&self) -> &str {
        self.chart
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.chart)
    }

    /// `repo` part of a `repo/chart` reference
    pub fn chart_repository(&self) -> Option<&str> {
        if self.is_local_chart() || self.chart.contains("://") {
            return None;
        }
        self.chart.split_once('/').map(|(repo, _)| repo)
    }

    pub fn is_local_chart(&self) -> bool {
        self.chart.starts_with('/')
            || self.chart.starts_with("./")
            || self.chart.starts_with("../")
            || self.chart == "."
    }

    /// Whether the release should be present after a sync
    pub fn desired(&self) -> bool {
        self.installed.unwrap_or(true)
    }

    pub fn is_tillerless(&self) -> bool {
        self.tillerless.unwrap_or(false)
    }
}

/// A release plus its selection state
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub spec: ReleaseSpec,
    pub filtered: bool,
}

impl Release {
    pub fn new(spec: ReleaseSpec) -> Self {
        Self {
            spec,
            filtered: false,
        }
    }

    pub fn id(&self) -> String {
        self.spec.id()
    }
}
