//! Chart dependency lock file
//!
//! The lock itself is produced elsewhere. Here it only answers one question:
//! which concrete version does a constraint resolve to for a given chart.

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{CoreError, Result};

/// Lock file format (`stackfile.lock`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartLock {
    /// Version of the tool that generated the lock
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub dependencies: Vec<LockedChart>,

    /// SHA256 of the requirements the lock was generated from
    #[serde(default)]
    pub digest: String,

    pub generated: DateTime<Utc>,
}

/// A locked chart with its exact version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedChart {
    pub name: String,
    #[serde(default)]
    pub repository: String,
    pub version: String,
}

impl ChartLock {
    pub fn new(version: impl Into<String>, requirements: &str) -> Self {
        Self {
            version: version.into(),
            dependencies: Vec::new(),
            digest: compute_sha256(requirements.as_bytes()),
            generated: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Check if the lock was generated from different requirements
    pub fn is_outdated(&self, requirements: &str) -> bool {
        self.digest != compute_sha256(requirements.as_bytes())
    }

    pub fn get(&self, chart: &str) -> Option<&LockedChart> {
        self.dependencies.iter().find(|d| d.name == chart)
    }

    /// Resolve a version constraint for `chart` (`repo/chart` or `chart`).
    ///
    /// Returns `None` when the chart is not locked. A locked version that
    /// does not satisfy the constraint is an error telling the user to
    /// refresh the lock.
    pub fn resolve_version(&self, chart: &str, constraint: &str) -> Result<Option<String>> {
        let (repository, name) = match chart.split_once('/') {
            Some((repo, name)) => (Some(repo), name),
            None => (None, chart),
        };

        let Some(locked) = self.dependencies.iter().find(|d| {
            d.name == name && repository.is_none_or(|r| d.repository.is_empty() || d.repository == r)
        }) else {
            return Ok(None);
        };

        if constraint.is_empty() {
            return Ok(Some(locked.version.clone()));
        }

        let version = Version::parse(locked.version.trim_start_matches('v'))?;
        let req = VersionReq::parse(constraint)?;
        if !req.matches(&version) {
            return Err(CoreError::LockMismatch {
                chart: chart.to_string(),
                locked: locked.version.clone(),
                constraint: constraint.to_string(),
            });
        }

        Ok(Some(locked.version.clone()))
    }
}

fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
