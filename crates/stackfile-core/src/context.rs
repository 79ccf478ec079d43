//! Template data records
//!
//! These are the fixed shapes exposed to templates next to plain maps:
//! `environment` and `release`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::release::ReleaseSpec;
use crate::values::Map;

/// `environment` as seen by templates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub name: String,
    pub kube_context: String,
    pub values: Map,
}

impl From<&Environment> for EnvironmentContext {
    fn from(env: &Environment) -> Self {
        Self {
            name: env.name.clone(),
            kube_context: env.kube_context.clone().unwrap_or_default(),
            values: env.values.clone(),
        }
    }
}

/// `release` as seen by templates, i.e. the fields rendered so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseContext {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub kube_context: String,
    pub labels: IndexMap<String, String>,
}

impl From<&ReleaseSpec> for ReleaseContext {
    fn from(spec: &ReleaseSpec) -> Self {
        Self {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            chart: spec.chart.clone(),
            kube_context: spec.kube_context.clone(),
            labels: spec.labels.clone(),
        }
    }
}
