//! Dependency planning: group releases into ordered batches
//!
//! Releases become nodes keyed by id; `needs` become edges. Batches are
//! Kahn layers: every release in a batch only depends on earlier batches.

use std::collections::{BTreeMap, BTreeSet};

use stackfile_core::{Release, ReleaseSpec};

use crate::error::{Result, StateError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Dependents first, as used for deletion
    pub reverse: bool,
}

/// Group releases into batches that can run in parallel.
///
/// Releases sharing an id collapse into one node and end up in the same
/// batch. Filtered releases are planned but contribute no edges.
pub fn group_releases_by_dependency(releases: &[Release], options: PlanOptions) -> Result<Vec<Vec<Release>>> {
    let mut nodes: BTreeMap<String, Vec<&Release>> = BTreeMap::new();
    for release in releases {
        nodes.entry(release.id()).or_default().push(release);
    }

    // dependency id -> dependents
    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut in_degree: BTreeMap<String, usize> = nodes.keys().map(|id| (id.clone(), 0)).collect();

    for release in releases.iter().filter(|r| !r.filtered) {
        let id = release.id();
        for need in &release.spec.needs {
            let dependency = resolve_need(&release.spec, need, &nodes)?;
            if dependency == id {
                return Err(StateError::Cycle { ids: vec![id] });
            }
            if dependents.entry(dependency).or_default().insert(id.clone()) {
                *in_degree.entry(id.clone()).or_default() += 1;
            }
        }
    }

    let mut batches: Vec<Vec<Release>> = Vec::new();
    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();

    while !ready.is_empty() {
        let mut next = BTreeSet::new();
        let mut batch = Vec::new();

        for id in &ready {
            in_degree.remove(id);
            batch.extend(nodes[id].iter().map(|r| (*r).clone()));
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(dependent.clone());
                    }
                }
            }
        }

        batches.push(batch);
        ready = next;
    }

    if !in_degree.is_empty() {
        return Err(StateError::Cycle {
            ids: in_degree.into_keys().collect(),
        });
    }

    if options.reverse {
        batches.reverse();
    }

    tracing::debug!(batches = batches.len(), releases = releases.len(), "planned releases");
    Ok(batches)
}

/// Resolve one `needs` entry of `dependent` to a node id.
///
/// An exact id wins. A bare name or `ns/name` is first tried in the
/// dependent's own context, then matched by name across all releases.
fn resolve_need(dependent: &ReleaseSpec, need: &str, nodes: &BTreeMap<String, Vec<&Release>>) -> Result<String> {
    if nodes.contains_key(need) {
        return Ok(need.to_string());
    }

    let segments: Vec<&str> = need.split('/').collect();
    let mut local = ReleaseSpec {
        kube_context: dependent.kube_context.clone(),
        ..Default::default()
    };
    match segments.as_slice() {
        [name] => {
            local.name = name.to_string();
            local.namespace = dependent.namespace.clone();
            local.tiller_namespace = dependent.tiller_namespace.clone();
        }
        [namespace, name] => {
            local.name = name.to_string();
            local.namespace = namespace.to_string();
        }
        _ => {}
    }
    if !local.name.is_empty() {
        let id = local.id();
        if nodes.contains_key(&id) {
            return Ok(id);
        }
    }

    let name = segments.last().copied().unwrap_or(need);
    let candidates: Vec<String> = nodes
        .iter()
        .filter(|(_, releases)| releases.iter().any(|r| r.spec.name == name))
        .map(|(id, _)| id.clone())
        .collect();

    match candidates.len() {
        1 => Ok(candidates.into_iter().next().unwrap_or_default()),
        0 => Err(StateError::UndefinedNeed {
            release: dependent.name.clone(),
            need: need.to_string(),
        }),
        _ => Err(StateError::AmbiguousNeed {
            release: dependent.name.clone(),
            need: need.to_string(),
            candidates,
        }),
    }
}
