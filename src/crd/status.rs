//! # GitRepo Status
//!
//! Status types for the GitRepo resource and the bundle summary it rolls up.
//!
//! Two writers touch this block: the reconciler (commit, job status,
//! generations, summary, display, most conditions) and the poller
//! (`pollingCommit`, `lastPollingTime`, the `GitPolling` condition).

use super::conditions::{Condition, HasConditions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed state of a GitRepo
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoStatus {
    /// Commit the current apply job is derived from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    /// Latest commit seen by the poller
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub polling_commit: String,
    /// Latest commit announced by a webhook
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub webhook_commit: String,
    /// Commit of the last apply job that completed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_executed_commit: String,
    /// Time of the last poll (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polling_time: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Last `forceSyncGeneration` a job was created for
    #[serde(default)]
    pub update_generation: i64,
    /// kstatus classification of the apply job: InProgress, Current, Failed, Terminating
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_job_status: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub summary: BundleSummary,
    #[serde(default)]
    pub display: GitRepoDisplay,
    #[serde(default)]
    pub ready_clusters: i32,
    #[serde(default)]
    pub desired_ready_clusters: i32,
}

impl HasConditions for GitRepoStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Human readable rollup shown by `kubectl get`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoDisplay {
    /// "ready/desired" bundle deployments
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ready_bundle_deployments: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub error: bool,
}

/// Deployment state of one bundle deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum BundleState {
    Ready,
    NotReady,
    WaitApplied,
    ErrApplied,
    OutOfSync,
    Pending,
    Modified,
}

impl BundleState {
    /// Total order used to pick the worst state of a group; least ready ranks highest
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            BundleState::ErrApplied => 7,
            BundleState::WaitApplied => 6,
            BundleState::Modified => 5,
            BundleState::OutOfSync => 4,
            BundleState::Pending => 3,
            BundleState::NotReady => 2,
            BundleState::Ready => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BundleState::Ready => "Ready",
            BundleState::NotReady => "NotReady",
            BundleState::WaitApplied => "WaitApplied",
            BundleState::ErrApplied => "ErrApplied",
            BundleState::OutOfSync => "OutOfSync",
            BundleState::Pending => "Pending",
            BundleState::Modified => "Modified",
        }
    }
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-state counters over a set of bundle deployments
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    #[serde(default)]
    pub not_ready: i32,
    #[serde(default)]
    pub wait_applied: i32,
    #[serde(default)]
    pub err_applied: i32,
    #[serde(default)]
    pub out_of_sync: i32,
    #[serde(default)]
    pub modified: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub pending: i32,
    #[serde(default)]
    pub desired_ready: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_resources: Vec<NonReadyResource>,
}

impl BundleSummary {
    #[must_use]
    pub fn count(&self, state: BundleState) -> i32 {
        match state {
            BundleState::Ready => self.ready,
            BundleState::NotReady => self.not_ready,
            BundleState::WaitApplied => self.wait_applied,
            BundleState::ErrApplied => self.err_applied,
            BundleState::OutOfSync => self.out_of_sync,
            BundleState::Pending => self.pending,
            BundleState::Modified => self.modified,
        }
    }
}

/// A bundle deployment that is not ready, with why
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyResource {
    pub name: String,
    pub state: BundleState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,
}

/// A deployed object that drifted from its desired manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedStatus {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub missing: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patch: String,
}

/// A deployed object that exists but is not ready
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyStatus {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
}

fn object_name(kind: &str, api_version: &str, namespace: &str, name: &str) -> String {
    let kind = kind.to_lowercase();
    let kind = match api_version.split_once('/') {
        Some((group, _)) => format!("{kind}.{group}"),
        None => kind,
    };
    if namespace.is_empty() {
        format!("{kind} {name}")
    } else {
        format!("{kind} {namespace}/{name}")
    }
}

impl std::fmt::Display for ModifiedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = object_name(&self.kind, &self.api_version, &self.namespace, &self.name);
        if self.missing {
            write!(f, "{name} missing")
        } else if self.delete {
            write!(f, "{name} extra")
        } else {
            write!(f, "{name} modified {}", self.patch)
        }
    }
}

impl std::fmt::Display for NonReadyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = object_name(&self.kind, &self.api_version, &self.namespace, &self.name);
        write!(f, "{name} {}", self.state)?;
        if !self.message.is_empty() {
            write!(f, " {}", self.message.join("; "))?;
        }
        Ok(())
    }
}
