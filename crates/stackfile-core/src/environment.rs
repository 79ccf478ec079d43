//! Named environments
//!
//! An environment is constructed once while the state is loaded. Later
//! layers (secrets, parent environments) never mutate it in place: every
//! [`Environment::merge`] produces a new generation built from deep copies.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, Result};
use crate::values::{Map, cast_keys_to_strings, deep_merge};

/// Name of the environment selected when none is given
pub const DEFAULT_ENVIRONMENT: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,

    /// Environment values, exposed to templates as `environment.values`
    #[serde(default)]
    pub values: Map,

    /// State-wide defaults, merged under `values` to form the rendered values
    #[serde(default)]
    pub defaults: Map,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_values(mut self, values: Map) -> Self {
        self.values = values;
        self
    }

    /// Copy through a canonical YAML round trip, normalising every map key.
    ///
    /// A serialization fault here means the maps hold something YAML cannot
    /// represent, which no user input can produce.
    pub fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            kube_context: self.kube_context.clone(),
            values: round_trip(&self.values)?,
            defaults: round_trip(&self.defaults)?,
        })
    }

    /// Overlay `other` onto a copy of `self`. Neither operand is modified.
    ///
    /// The overlay's name and kube context win when they are non-empty.
    /// Values and defaults follow [`deep_merge`] polarity, so an overlay
    /// `null` replaces a populated map.
    pub fn merge(&self, other: Option<&Environment>) -> Result<Environment> {
        let mut merged = self.deep_copy()?;
        let Some(other) = other else {
            return Ok(merged);
        };
        let other = other.deep_copy()?;

        if !other.name.is_empty() {
            merged.name = other.name;
        }
        if other.kube_context.as_deref().is_some_and(|c| !c.is_empty()) {
            merged.kube_context = other.kube_context;
        }
        merged.values = merge_into(merged.values, other.values);
        merged.defaults = merge_into(merged.defaults, other.defaults);

        Ok(merged)
    }

    /// Defaults overlaid by values: what templates see as `values`
    pub fn merged_values(&self) -> Result<Map> {
        let defaults = round_trip(&self.defaults)?;
        let values = round_trip(&self.values)?;
        Ok(merge_into(defaults, values))
    }
}

fn merge_into(base: Map, overlay: Map) -> Map {
    let mut merged = JsonValue::Object(base);
    deep_merge(&mut merged, &JsonValue::Object(overlay));
    match merged {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn round_trip(map: &Map) -> Result<Map> {
    let yaml = serde_yaml::to_string(map)
        .map_err(|e| CoreError::invariant(format!("failed to serialize values: {}", e)))?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml)
        .map_err(|e| CoreError::invariant(format!("failed to deserialize values: {}", e)))?;
    match cast_keys_to_strings(parsed)? {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(Map::new()),
        other => Err(CoreError::invariant(format!(
            "values round trip produced {}",
            other
        ))),
    }
}
