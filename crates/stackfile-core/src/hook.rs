//! Lifecycle hook declarations

use serde::{Deserialize, Serialize};

/// Hook declared globally or on a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    #[serde(default)]
    pub name: String,

    /// Events this hook fires on (e.g. `presync`, `cleanup`)
    #[serde(default)]
    pub events: Vec<String>,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Log captured output line by line
    #[serde(default)]
    pub show_logs: bool,

    /// Shorthand for `kubectl apply -f|-k`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubectl_apply: Option<KubectlApply>,
}

/// Exactly one of `filename` or `kustomize` must be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubectlApply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<String>,
}

impl Hook {
    pub fn fires_on(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}
