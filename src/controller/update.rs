//! # Optimistic Status Update
//!
//! The single read-mutate-write loop used by every writer of GitRepo status.
//!
//! Each attempt reads the live object, applies the mutation to a copy of its
//! status and sends only the difference, tagged with the resourceVersion it
//! was computed from. A conflict starts the next attempt from a fresh read.
//! Dropping the returned future abandons the loop between attempts.

use crate::crd::{GitRepo, GitRepoStatus};
use crate::observability::metrics;
use crate::store::{merge_patch_diff, ObjectStore, StoreError};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("GitRepo {0} not found")]
    NotFound(String),
    #[error("failed to update GitRepo {key} status after {attempts} conflicting attempts: {last}")]
    ConflictsExhausted {
        key: String,
        attempts: u32,
        #[source]
        last: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn to_value(status: &GitRepoStatus) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(status).map_err(|e| StoreError::Serialization("GitRepo status".to_string(), e))
}

/// Apply `mutate` to the live status of `namespace/name`
///
/// Returns the updated object, or `None` when the mutation changed nothing
/// and no write was sent.
pub async fn update_status<F>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<Option<GitRepo>, UpdateError>
where
    F: FnMut(&mut GitRepoStatus) + Send,
{
    let key = format!("{namespace}/{name}");
    let attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let live = store
            .get_gitrepo(namespace, name)
            .await?
            .ok_or_else(|| UpdateError::NotFound(key.clone()))?;

        let current = live.status_or_default();
        let mut desired = current.clone();
        mutate(&mut desired);

        let Some(diff) = merge_patch_diff(&to_value(&current)?, &to_value(&desired)?) else {
            debug!(resource.name = name, resource.namespace = namespace, "Status unchanged, skipping update");
            return Ok(None);
        };

        let resource_version = live.metadata.resource_version.as_deref().unwrap_or_default();
        match store
            .patch_gitrepo_status(namespace, name, resource_version, json!({ "status": diff }))
            .await
        {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                metrics::increment_status_update_conflicts();
                if attempt >= attempts {
                    return Err(UpdateError::ConflictsExhausted {
                        key,
                        attempts: attempt,
                        last: e,
                    });
                }
                debug!(
                    resource.name = name,
                    resource.namespace = namespace,
                    attempt = attempt,
                    "Status update conflicted, retrying with a fresh read"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
}
