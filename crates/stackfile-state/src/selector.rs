//! Label selectors, release conditions and transitive needs

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use stackfile_core::{Map, Release, ReleaseSpec};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, StateError};

static POSITIVE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9_./-]+)=([a-zA-Z0-9_./-]+)$").expect("valid regex"));
static NEGATIVE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9_./-]+)!=([a-zA-Z0-9_./-]+)$").expect("valid regex"));

/// A parsed `k=v,k2!=v2` selector; every term must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    positive: Vec<(String, String)>,
    negative: Vec<(String, String)>,
}

impl LabelFilter {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut filter = Self::default();
        for term in selector.split(',').map(str::trim) {
            if let Some(caps) = NEGATIVE_LABEL.captures(term) {
                filter.negative.push((caps[1].to_string(), caps[2].to_string()));
            } else if let Some(caps) = POSITIVE_LABEL.captures(term) {
                filter.positive.push((caps[1].to_string(), caps[2].to_string()));
            } else {
                return Err(StateError::Selector {
                    selector: selector.to_string(),
                    term: term.to_string(),
                });
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        self.positive
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
            && self
                .negative
                .iter()
                .all(|(k, v)| labels.get(k).is_none_or(|actual| actual != v))
    }
}

/// Labels a selector sees: common labels, the release's own, then the
/// implicit `name`, `namespace` and `chart`.
pub fn effective_labels(spec: &ReleaseSpec, common_labels: &IndexMap<String, String>) -> IndexMap<String, String> {
    let mut labels = common_labels.clone();
    labels.extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels.insert("name".into(), spec.name.clone());
    labels.insert("namespace".into(), spec.namespace.clone());
    labels.insert("chart".into(), spec.chart_name().to_string());
    labels
}

/// Evaluate a `foo.enabled` condition against the rendered values
pub fn evaluate_condition(spec: &ReleaseSpec, values: &Map) -> Result<bool> {
    if spec.condition.is_empty() {
        return Ok(true);
    }
    let condition_error = |message: String| StateError::Condition {
        release: spec.name.clone(),
        message,
    };

    let Some((field, "enabled")) = spec.condition.split_once('.') else {
        return Err(condition_error(format!(
            "condition `{}` must be in the form `foo.enabled`",
            spec.condition
        )));
    };
    if field.is_empty() || field.contains('.') {
        return Err(condition_error(format!(
            "condition `{}` must be in the form `foo.enabled`",
            spec.condition
        )));
    }

    match values.get(field) {
        None => Err(condition_error(format!(
            "environment values do not contain field `{}`",
            field
        ))),
        Some(JsonValue::Null) => Err(condition_error(format!(
            "environment values field `{}` is null",
            field
        ))),
        Some(JsonValue::Object(map)) => Ok(map.get("enabled") == Some(&JsonValue::Bool(true))),
        Some(other) => Err(condition_error(format!(
            "environment values field `{}` must be a map, got a {}",
            field,
            stackfile_core::values::type_name(other)
        ))),
    }
}

/// Wrap every release with its selection state.
///
/// With no selectors everything is selected; otherwise a release is kept
/// when any selector matches. A false condition always filters.
pub fn mark_filtered_releases(
    releases: &[ReleaseSpec],
    selectors: &[String],
    common_labels: &IndexMap<String, String>,
    values: &Map,
    include_transitive_needs: bool,
) -> Result<Vec<Release>> {
    let filters = selectors
        .iter()
        .map(|s| LabelFilter::parse(s))
        .collect::<Result<Vec<_>>>()?;

    let mut marked = Vec::with_capacity(releases.len());
    for spec in releases {
        let labels = effective_labels(spec, common_labels);
        let selected = filters.is_empty() || filters.iter().any(|f| f.matches(&labels));
        let condition = evaluate_condition(spec, values)?;
        marked.push(Release {
            spec: spec.clone(),
            filtered: !selected || !condition,
        });
    }

    if include_transitive_needs {
        include_needs(&mut marked);
    }

    let selected = marked.iter().filter(|r| !r.filtered).count();
    tracing::debug!(selected, total = marked.len(), "releases matched selectors");
    Ok(marked)
}

/// Un-filter everything a selected release needs, transitively
fn include_needs(releases: &mut [Release]) {
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, release) in releases.iter().enumerate() {
        by_name.entry(release.spec.name.clone()).or_default().push(i);
    }

    let mut stack: Vec<usize> = (0..releases.len()).filter(|i| !releases[*i].filtered).collect();
    let mut visited: HashSet<usize> = stack.iter().copied().collect();

    while let Some(i) = stack.pop() {
        let needs: Vec<String> = releases[i].spec.needs.clone();
        for need in needs {
            let short = need.rsplit('/').next().unwrap_or(&need);
            for &j in by_name.get(short).into_iter().flatten() {
                if visited.insert(j) {
                    if releases[j].filtered {
                        tracing::debug!("including {} needed by {}", releases[j].spec.name, releases[i].spec.name);
                    }
                    releases[j].filtered = false;
                    stack.push(j);
                }
            }
        }
    }
}
