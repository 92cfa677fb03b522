//! # GitRepo
//!
//! The user-authored resource: where to fetch manifests from, how often to
//! poll, and which namespace and identity the apply job uses.

use super::status::GitRepoStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Git source
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gitops.octopilot.io",
    version = "v1alpha1",
    kind = "GitRepo",
    namespaced,
    status = "GitRepoStatus",
    shortname = "gitrepo",
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.commit"}"#,
    printcolumn = r#"{"name":"BundleDeployments-Ready", "type":"string", "jsonPath":".status.display.readyBundleDeployments"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoSpec {
    /// URL of the repository
    #[serde(default)]
    pub repo: String,
    /// Branch to follow; ignored when `revision` is set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    /// Commit or tag to pin
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Directories in the repository to deploy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// How often to check the remote for a new commit ("30s", "5m", "1h")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub polling_interval: String,
    /// Namespace all deployed resources are forced into
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
    /// Service account used on the downstream clusters
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account: String,
    /// Secret holding git credentials (basic-auth or ssh-auth)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret_name: String,
    /// Secret holding helm repository credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helm_secret_name: String,
    /// Secret holding per-path helm repository credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helm_secret_name_for_paths: String,
    /// Base64 encoded PEM bundle trusted when cloning
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_bundle: String,
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
    /// Bump to force a new apply job for the current commit
    #[serde(default)]
    pub force_sync_generation: i64,
    /// Never poll; the commit is resolved when no job exists
    #[serde(default)]
    pub disable_polling: bool,
    /// Deploy bundles paused
    #[serde(default)]
    pub paused: bool,
}

impl GitRepo {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Status, or the empty status for a freshly created repo
    pub fn status_or_default(&self) -> GitRepoStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Status for in-place edits, created empty when missing
    pub fn status_mut(&mut self) -> &mut GitRepoStatus {
        self.status.get_or_insert_with(GitRepoStatus::default)
    }

    /// Whether the spec changed since the last observed generation
    ///
    /// A repo that was never observed (`observedGeneration` 0) has not changed.
    pub fn generation_changed(&self) -> bool {
        let observed = self.status.as_ref().map_or(0, |s| s.observed_generation);
        observed > 0 && self.generation() != observed
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|item| item == finalizer))
    }
}
