//! # Job RBAC
//!
//! The identity an apply job runs as: a service account, a role and the
//! binding between them, all named `git-<repo>` and owned by the GitRepo so
//! they are garbage collected with it.

use crate::constants::API_GROUP;
use crate::controller::names::service_account_name;
use crate::crd::GitRepo;
use crate::store::{ObjectStore, StoreError};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use tracing::debug;

fn owner_reference(repo: &GitRepo) -> Option<Vec<OwnerReference>> {
    repo.controller_owner_ref(&()).map(|owner| vec![owner])
}

/// Metadata for an object named `name` owned by `repo`
pub(crate) fn owned_metadata(repo: &GitRepo, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(repo.namespace_or_default().to_string()),
        owner_references: owner_reference(repo),
        ..ObjectMeta::default()
    }
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(ToString::to_string).collect()),
        verbs: verbs.iter().map(ToString::to_string).collect(),
        ..PolicyRule::default()
    }
}

#[must_use]
pub fn service_account(repo: &GitRepo) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_metadata(repo, service_account_name(repo)),
        ..ServiceAccount::default()
    }
}

/// Role letting the job publish bundles and read its own GitRepo
#[must_use]
pub fn role(repo: &GitRepo) -> Role {
    Role {
        metadata: owned_metadata(repo, service_account_name(repo)),
        rules: Some(vec![
            rule(API_GROUP, &["bundles"], &["get", "list", "create", "update", "delete"]),
            rule(API_GROUP, &["gitrepos"], &["get"]),
            rule("", &["secrets"], &["get", "create", "update", "delete"]),
        ]),
    }
}

#[must_use]
pub fn role_binding(repo: &GitRepo) -> RoleBinding {
    let name = service_account_name(repo);
    RoleBinding {
        metadata: owned_metadata(repo, name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(repo.namespace_or_default().to_string()),
            ..Subject::default()
        }]),
    }
}

/// Make sure the job's service account, role and role binding exist
///
/// The service account is only ever created. Role and binding are applied on
/// every call so their content follows the current rules.
pub async fn ensure_rbac(store: &dyn ObjectStore, repo: &GitRepo) -> Result<(), StoreError> {
    match store.create_service_account(&service_account(repo)).await {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {
            debug!(resource.name = repo.name(), "Job service account already exists");
        }
        Err(e) => return Err(e),
    }
    store.apply_role(&role(repo)).await?;
    store.apply_role_binding(&role_binding(repo)).await?;
    Ok(())
}
