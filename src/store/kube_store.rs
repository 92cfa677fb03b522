//! [`ObjectStore`] backed by the Kubernetes API.

use super::{ObjectStore, StoreError};
use crate::constants::{BUNDLE_NAMESPACE_LABEL, FIELD_MANAGER, REPO_LABEL};
use crate::crd::{BundleDeployment, GitRepo, GitRepoRestriction};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde_json::json;
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Server-side apply with force, so the controller owns every field it sets
    async fn apply<K>(&self, object: &K) -> Result<(), StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::Serialize
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.meta().namespace.as_deref().unwrap_or("default");
        let name = object.meta().name.as_deref().unwrap_or_default();
        let api: Api<K> = self.namespaced(namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
            .await?;
        Ok(())
    }
}

fn absent_on_404<T>(result: Result<T, kube::Error>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_gitrepo(&self, namespace: &str, name: &str) -> Result<Option<GitRepo>, StoreError> {
        let api: Api<GitRepo> = self.namespaced(namespace);
        absent_on_404(api.get(name).await)
    }

    async fn patch_gitrepo_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        mut patch: serde_json::Value,
    ) -> Result<GitRepo, StoreError> {
        let api: Api<GitRepo> = self.namespaced(namespace);
        // resourceVersion in a merge patch makes the API server reject stale writes
        if let Some(object) = patch.as_object_mut() {
            object.insert(
                "metadata".to_string(),
                json!({ "resourceVersion": resource_version }),
            );
        }
        debug!(
            resource.name = name,
            resource.namespace = namespace,
            "Patching GitRepo status"
        );
        Ok(api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_gitrepo_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let api: Api<GitRepo> = self.namespaced(namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_restrictions(&self, namespace: &str) -> Result<Vec<GitRepoRestriction>, StoreError> {
        let api: Api<GitRepoRestriction> = self.namespaced(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_bundle_deployments(
        &self,
        repo_namespace: &str,
        repo_name: &str,
    ) -> Result<Vec<BundleDeployment>, StoreError> {
        let api: Api<BundleDeployment> = Api::all(self.client.clone());
        let selector = format!("{REPO_LABEL}={repo_name},{BUNDLE_NAMESPACE_LABEL}={repo_namespace}");
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError> {
        let api: Api<Job> = self.namespaced(namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
        let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Job> = self.namespaced(namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Job> = self.namespaced(namespace);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>, StoreError> {
        let api: Api<Pod> = self.namespaced(namespace);
        let selector = format!("job-name={job_name}");
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let api: Api<Secret> = self.namespaced(namespace);
        absent_on_404(api.get(name).await)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        self.apply(secret).await
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        api.create(&PostParams::default(), account).await?;
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<(), StoreError> {
        self.apply(role).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError> {
        self.apply(binding).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, StoreError> {
        let api: Api<Deployment> = self.namespaced(namespace);
        absent_on_404(api.get(name).await)
    }
}
