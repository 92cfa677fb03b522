//! # Object Store
//!
//! The cluster API as seen by the reconciler and the poller. Production code
//! talks to Kubernetes through [`KubeStore`]; tests plug in an in-memory store.
//!
//! Status writes are JSON merge patches carrying the `resourceVersion` the
//! patch was computed against, so a concurrent writer turns into
//! [`StoreError::Conflict`] instead of a lost update.

mod events;
mod kube_store;
mod merge_patch;

pub use events::{EventKind, EventRecorder, KubeEventRecorder};
pub use kube_store::KubeStore;
pub use merge_patch::{apply_merge_patch, merge_patch_diff};

use crate::crd::{BundleDeployment, GitRepo, GitRepoRestriction};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("failed to serialize {0}: {1}")]
    Serialization(String, #[source] serde_json::Error),
    #[error(transparent)]
    Kube(kube::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message.clone()),
            _ => StoreError::Kube(error),
        }
    }
}

/// Reads and writes against the cluster API
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_gitrepo(&self, namespace: &str, name: &str) -> Result<Option<GitRepo>, StoreError>;

    /// Merge-patch the status, failing with `Conflict` if `resource_version` is stale
    async fn patch_gitrepo_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        patch: serde_json::Value,
    ) -> Result<GitRepo, StoreError>;

    /// Replace the finalizer list, failing with `Conflict` if `resource_version` is stale
    async fn patch_gitrepo_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError>;

    async fn list_restrictions(&self, namespace: &str) -> Result<Vec<GitRepoRestriction>, StoreError>;

    /// All bundle deployments labelled for the repo, across namespaces
    async fn list_bundle_deployments(
        &self,
        repo_namespace: &str,
        repo_name: &str,
    ) -> Result<Vec<BundleDeployment>, StoreError>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError>;

    async fn create_job(&self, job: &Job) -> Result<Job, StoreError>;

    /// Delete with background propagation
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Pods created for the job, selected by the `job-name` label
    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    /// Create or update
    async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError>;

    /// Create only; an existing account yields `AlreadyExists`
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError>;

    /// Create or update
    async fn apply_role(&self, role: &Role) -> Result<(), StoreError>;

    /// Create or update
    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, StoreError>;
}
