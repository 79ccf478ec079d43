//! Values handling with nil-aware deep merge
//!
//! Merge polarity matters here. An overlay that sets a key to `null` or to an
//! empty scalar replaces whatever the base holds at that key, including a
//! populated map. Only maps are merged recursively; sequences are replaced
//! by [`deep_merge`] and concatenated by [`merge_append`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// String-keyed ordered mapping used for every values document
pub type Map = serde_json::Map<String, JsonValue>;

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML, coercing non-string map keys
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: YamlValue = serde_yaml::from_str(yaml)?;
        Ok(Self(cast_keys_to_strings(value)?))
    }

    /// Deep merge another Values into this one
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        if !self.0.is_object() {
            self.0 = JsonValue::Object(Map::new());
        }
        let parts: Vec<&str> = path.split('.').collect();
        match &mut self.0 {
            JsonValue::Object(map) => set_path(map, &parts, value),
            _ => Err(CoreError::invariant("values root is not a map")),
        }
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        get_path(&self.0, path)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Convert into a map, treating `null` as empty
    pub fn into_map(self) -> Result<Map> {
        match self.0 {
            JsonValue::Object(map) => Ok(map),
            JsonValue::Null => Ok(Map::new()),
            other => Err(CoreError::ValuesMerge {
                message: format!("expected a map of values, got {}", type_name(&other)),
            }),
        }
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }
}

/// Deep merge `overlay` onto `base`
///
/// - Maps: recursive merge
/// - `null` and empty scalars in the overlay: replace the base value
/// - Everything else, sequences included: overlay replaces base
pub fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Document-level merge: like [`deep_merge`] but sequences are concatenated
/// and an overlay `null` leaves the base untouched.
pub fn merge_append(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (_, JsonValue::Null) => {}
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_append(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (JsonValue::Array(base_items), JsonValue::Array(overlay_items)) => {
            base_items.extend(overlay_items.iter().cloned());
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Merge two optional maps. A missing base yields a copy of the overlay.
pub fn merge_maps(base: Option<&Map>, overlay: Option<&Map>) -> Option<Map> {
    match (base, overlay) {
        (None, None) => None,
        (Some(base), None) => Some(base.clone()),
        (None, Some(overlay)) => Some(overlay.clone()),
        (Some(base), Some(overlay)) => {
            let mut merged = JsonValue::Object(base.clone());
            deep_merge(&mut merged, &JsonValue::Object(overlay.clone()));
            match merged {
                JsonValue::Object(map) => Some(map),
                _ => None,
            }
        }
    }
}

/// Set a nested value, creating intermediate maps as needed.
///
/// An empty path is a caller bug and yields [`CoreError::Invariant`].
pub fn set_path(map: &mut Map, path: &[&str], value: JsonValue) -> Result<()> {
    let Some((key, remaining)) = path.split_first() else {
        return Err(CoreError::invariant("set_path called with an empty key path"));
    };

    if remaining.is_empty() {
        map.insert((*key).to_string(), value);
        return Ok(());
    }

    let entry = map
        .entry((*key).to_string())
        .or_insert_with(|| JsonValue::Object(Map::new()));
    if !entry.is_object() {
        *entry = JsonValue::Object(Map::new());
    }
    match entry {
        JsonValue::Object(child) => set_path(child, remaining, value),
        _ => Err(CoreError::invariant("intermediate value is not a map")),
    }
}

/// Get a nested value by dotted path
pub fn get_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            JsonValue::Object(map) => map.get(segment),
            _ => None,
        })
}

/// Recursively convert a YAML document into string-keyed JSON.
///
/// String keys pass through, numeric and boolean keys become their textual
/// form. Any other key type is rejected.
pub fn cast_keys_to_strings(value: YamlValue) -> Result<JsonValue> {
    cast_at(value, "")
}

fn cast_at(value: YamlValue, path: &str) -> Result<JsonValue> {
    Ok(match value {
        YamlValue::Null => JsonValue::Null,
        YamlValue::Bool(b) => JsonValue::Bool(b),
        YamlValue::Number(n) => yaml_number(&n),
        YamlValue::String(s) => JsonValue::String(s),
        YamlValue::Sequence(items) => JsonValue::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| cast_at(item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>>>()?,
        ),
        YamlValue::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, child) in mapping {
                let key = match key {
                    YamlValue::String(s) => s,
                    YamlValue::Number(n) => n.to_string(),
                    YamlValue::Bool(b) => b.to_string(),
                    other => {
                        return Err(CoreError::NonStringKey {
                            key: format!("{:?}", other),
                            path: path.to_string(),
                        });
                    }
                };
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                map.insert(key, cast_at(child, &child_path)?);
            }
            JsonValue::Object(map)
        }
        YamlValue::Tagged(tagged) => cast_at(tagged.value, path)?,
    })
}

fn yaml_number(n: &serde_yaml::Number) -> JsonValue {
    if let Some(i) = n.as_i64() {
        JsonValue::from(i)
    } else if let Some(u) = n.as_u64() {
        JsonValue::from(u)
    } else {
        n.as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(n.to_string()))
    }
}

/// Human-readable kind of a JSON value, for error messages
pub fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "map",
    }
}

/// Parse `key=value` override arguments
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::ValuesMerge {
            message: format!("Invalid --state-values-set format: '{}'. Expected key=value", arg),
        })?;

        let json_value = if val == "true" {
            JsonValue::Bool(true)
        } else if val == "false" {
            JsonValue::Bool(false)
        } else if val == "null" {
            JsonValue::Null
        } else if let Ok(num) = val.parse::<i64>() {
            JsonValue::Number(num.into())
        } else if let Some(num) = val.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            JsonValue::Number(num)
        } else if val.starts_with('[') || val.starts_with('{') {
            serde_json::from_str(val).map_err(|e| CoreError::ValuesMerge {
                message: format!("Invalid JSON in --state-values-set '{}': {}", arg, e),
            })?
        } else {
            JsonValue::String(val.to_string())
        };

        values.set(key, json_value)?;
    }

    Ok(values)
}
