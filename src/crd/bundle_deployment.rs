//! # BundleDeployment
//!
//! One bundle deployed to one downstream cluster. Written by the deployment
//! agent; this controller only reads it to roll up GitRepo status.

use super::conditions::{Condition, HasConditions};
use super::status::{ModifiedStatus, NonReadyStatus};
use crate::constants::{BUNDLE_NAME_LABEL, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gitops.octopilot.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    namespaced,
    status = "BundleDeploymentStatus",
    shortname = "bd"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// Deployment the agent should converge to
    #[serde(default, rename = "deploymentID")]
    pub deployment_id: String,
    /// Deployment staged for the next rollout
    #[serde(default, rename = "stagedDeploymentID")]
    pub staged_deployment_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    /// Deployment the agent last applied
    #[serde(default, rename = "appliedDeploymentID")]
    pub applied_deployment_id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub non_modified: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,
}

impl HasConditions for BundleDeploymentStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl BundleDeployment {
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// `(cluster namespace, cluster name)` this deployment targets, when labelled
    pub fn cluster_key(&self) -> Option<(String, String)> {
        let name = self.label(CLUSTER_LABEL)?;
        let namespace = self.label(CLUSTER_NAMESPACE_LABEL)?;
        Some((namespace.to_string(), name.to_string()))
    }

    /// Bundle this deployment belongs to, falling back to its own name
    pub fn bundle_name(&self) -> &str {
        self.label(BUNDLE_NAME_LABEL)
            .or(self.metadata.name.as_deref())
            .unwrap_or_default()
    }
}
