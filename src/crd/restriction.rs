//! # GitRepoRestriction
//!
//! Namespace-scoped policy limiting what a GitRepo may request.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gitops.octopilot.io",
    version = "v1alpha1",
    kind = "GitRepoRestriction",
    namespaced,
    shortname = "gitreporestriction"
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoRestrictionSpec {
    /// Service account used when a GitRepo does not name one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_service_account: String,
    #[serde(default)]
    pub allowed_service_accounts: Vec<String>,
    /// Exact repo URLs or regular expressions a GitRepo may point at
    #[serde(default)]
    pub allowed_repo_patterns: Vec<String>,
    /// Client secret used when a GitRepo does not name one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_client_secret_name: String,
    #[serde(default)]
    pub allowed_client_secret_names: Vec<String>,
    #[serde(default)]
    pub allowed_target_namespaces: Vec<String>,
}
