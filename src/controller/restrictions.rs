//! # Restrictions
//!
//! Checks a GitRepo against the GitRepoRestriction objects of its namespace
//! and fills in their defaults.
//!
//! All restrictions of a namespace act as one: they are sorted by name, the
//! first non-empty default wins and allow-lists are unioned.

use crate::crd::{GitRepo, GitRepoRestriction, GitRepoRestrictionSpec};
use crate::store::{ObjectStore, StoreError};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestrictionError {
    #[error("empty targetNamespace denied, because allowedTargetNamespaces restriction is present")]
    EmptyTargetNamespace,
    #[error("disallowed {field} {value}: {reason}")]
    Denied {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RestrictionError {
    /// Whether this is a policy denial rather than a failure to read the policies
    #[must_use]
    pub fn is_denied(&self) -> bool {
        !matches!(self, RestrictionError::Store(_))
    }
}

/// Merge all restrictions of a namespace into one
#[must_use]
pub fn aggregate(mut restrictions: Vec<GitRepoRestriction>) -> GitRepoRestrictionSpec {
    restrictions.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    let mut result = GitRepoRestrictionSpec::default();
    for restriction in restrictions {
        let spec = restriction.spec;
        if result.default_service_account.is_empty() {
            result.default_service_account = spec.default_service_account;
        }
        if result.default_client_secret_name.is_empty() {
            result.default_client_secret_name = spec.default_client_secret_name;
        }
        result.allowed_service_accounts.extend(spec.allowed_service_accounts);
        result.allowed_client_secret_names.extend(spec.allowed_client_secret_names);
        result.allowed_repo_patterns.extend(spec.allowed_repo_patterns);
        result.allowed_target_namespaces.extend(spec.allowed_target_namespaces);
    }
    result
}

/// Resolve `current` against an exact allow-list; empty values take `default`
pub fn is_allowed(current: &str, default: &str, allowed: &[String]) -> Result<String, String> {
    if current.is_empty() {
        return Ok(default.to_string());
    }
    if allowed.is_empty() || allowed.iter().any(|value| value == current) {
        return Ok(current.to_string());
    }
    Err(format!("{current} not in allowed set {allowed:?}"))
}

/// Like [`is_allowed`], but each pattern matches verbatim or as a regular expression
pub fn is_allowed_by_regex(current: &str, default: &str, patterns: &[String]) -> Result<String, String> {
    if current.is_empty() {
        return Ok(default.to_string());
    }
    if patterns.is_empty() {
        return Ok(current.to_string());
    }
    for pattern in patterns {
        if pattern == current {
            return Ok(current.to_string());
        }
        let regex = Regex::new(pattern)
            .map_err(|e| format!("GitRepoRestriction failed to compile regex '{pattern}': {e}"))?;
        if regex.is_match(current) {
            return Ok(current.to_string());
        }
    }
    Err(format!("{current} not in allowed set {patterns:?}"))
}

fn denied(field: &'static str, value: &str) -> impl FnOnce(String) -> RestrictionError {
    let value = value.to_string();
    move |reason| RestrictionError::Denied { field, value, reason }
}

/// Check `repo` against `restriction` and write the resolved values back into its spec
///
/// On error the spec is left untouched.
pub fn apply_restriction(repo: &mut GitRepo, restriction: &GitRepoRestrictionSpec) -> Result<(), RestrictionError> {
    let spec = &repo.spec;
    if !restriction.allowed_target_namespaces.is_empty() && spec.target_namespace.is_empty() {
        return Err(RestrictionError::EmptyTargetNamespace);
    }

    let target_namespace = is_allowed(&spec.target_namespace, "", &restriction.allowed_target_namespaces)
        .map_err(denied("targetNamespace", &spec.target_namespace))?;
    let service_account = is_allowed(
        &spec.service_account,
        &restriction.default_service_account,
        &restriction.allowed_service_accounts,
    )
    .map_err(denied("serviceAccount", &spec.service_account))?;
    let repo_url = is_allowed_by_regex(&spec.repo, "", &restriction.allowed_repo_patterns)
        .map_err(denied("repo", &spec.repo))?;
    let client_secret_name = is_allowed(
        &spec.client_secret_name,
        &restriction.default_client_secret_name,
        &restriction.allowed_client_secret_names,
    )
    .map_err(denied("clientSecretName", &spec.client_secret_name))?;

    repo.spec.target_namespace = target_namespace;
    repo.spec.service_account = service_account;
    repo.spec.repo = repo_url;
    repo.spec.client_secret_name = client_secret_name;
    Ok(())
}

/// Authorize `repo` against the restrictions of its namespace, assigning defaults
///
/// Without any restriction in the namespace the repo is left unchanged.
pub async fn authorize_and_assign_defaults(
    store: &dyn ObjectStore,
    repo: &mut GitRepo,
) -> Result<(), RestrictionError> {
    let restrictions = store.list_restrictions(repo.namespace_or_default()).await?;
    if restrictions.is_empty() {
        return Ok(());
    }
    apply_restriction(repo, &aggregate(restrictions))
}
