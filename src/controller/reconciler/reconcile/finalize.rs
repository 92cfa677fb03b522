//! # Reconciliation Finalization
//!
//! Status write-back at the end of a pass, the error variant of it, and the
//! finalizer handling around deletion.

use crate::constants::{GITREPO_FINALIZER, GIT_POLLING_CONDITION};
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::controller::status::set_accepted;
use crate::controller::update::{update_status, UpdateError};
use crate::crd::{GitRepo, GitRepoStatus};
use anyhow::Context;
use tracing::{debug, info, warn};

/// Copy the fields a reconcile pass owns from `desired` onto the live status
///
/// Polling-owned fields are left alone. The `GitPolling` condition is only
/// reconcile-owned while polling is disabled, and an empty commit never
/// replaces a live one.
pub fn apply_reconciled_fields(live: &mut GitRepoStatus, desired: &GitRepoStatus, disable_polling: bool) {
    if !desired.commit.is_empty() {
        live.commit.clone_from(&desired.commit);
    }
    live.git_job_status.clone_from(&desired.git_job_status);
    live.last_executed_commit.clone_from(&desired.last_executed_commit);
    live.observed_generation = desired.observed_generation;
    live.update_generation = desired.update_generation;
    live.summary = desired.summary.clone();
    live.display = desired.display.clone();
    live.ready_clusters = desired.ready_clusters;
    live.desired_ready_clusters = desired.desired_ready_clusters;

    for condition in &desired.conditions {
        if condition.r#type == GIT_POLLING_CONDITION && !disable_polling {
            continue;
        }
        match live.conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) => *existing = condition.clone(),
            None => live.conditions.push(condition.clone()),
        }
    }
}

impl Reconciler {
    /// Write the reconcile-owned part of `status` to the repo
    pub(crate) async fn write_status(&self, repo: &GitRepo, status: &GitRepoStatus) -> Result<(), UpdateError> {
        let disable_polling = repo.spec.disable_polling;
        update_status(
            self.collaborators.store.as_ref(),
            repo.namespace_or_default(),
            repo.name(),
            self.config.status_update_max_attempts,
            |live| apply_reconciled_fields(live, status, disable_polling),
        )
        .await
        .map(|_| ())
    }

    /// Write `status` with `Accepted` set to True
    pub(crate) async fn update_accepted_status(&self, repo: &GitRepo, mut status: GitRepoStatus) -> Result<(), UpdateError> {
        set_accepted(&mut status, None, self.collaborators.clock.now());
        self.write_status(repo, &status).await
    }

    /// Write `status` with `Accepted` carrying `error`
    ///
    /// Returns the error to report for the pass, aggregated with the write
    /// failure when the status could not be recorded.
    pub(crate) async fn update_error_status(
        &self,
        repo: &GitRepo,
        mut status: GitRepoStatus,
        error: ReconcilerError,
    ) -> ReconcilerError {
        let message = error.to_string();
        set_accepted(&mut status, Some(&message), self.collaborators.clock.now());

        match self.write_status(repo, &status).await {
            Ok(()) => error,
            Err(update) => ReconcilerError::StatusNotRecorded {
                error: Box::new(error),
                update,
            },
        }
    }

    pub(crate) async fn ensure_finalizer(&self, repo: &GitRepo) -> Result<(), ReconcilerError> {
        if repo.has_finalizer(GITREPO_FINALIZER) {
            return Ok(());
        }
        let mut finalizers = repo.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(GITREPO_FINALIZER.to_string());
        self.collaborators
            .store
            .patch_gitrepo_finalizers(
                repo.namespace_or_default(),
                repo.name(),
                repo.metadata.resource_version.as_deref().unwrap_or_default(),
                finalizers,
            )
            .await
            .context("failed to add finalizer")?;
        debug!(
            resource.name = repo.name(),
            resource.namespace = repo.namespace_or_default(),
            "Added finalizer"
        );
        Ok(())
    }

    /// Stop polling a deleted repo and release it
    ///
    /// Jobs, RBAC objects and the CA bundle secret are owned by the repo and
    /// garbage collected with it.
    pub(crate) async fn handle_delete(&self, repo: &GitRepo) -> Result<(), ReconcilerError> {
        let (namespace, name) = (repo.namespace_or_default(), repo.name());
        info!(resource.name = name, resource.namespace = namespace, "GitRepo deleted, removing polling task");
        self.scheduler.remove(namespace, name);
        self.forget_backoff(namespace, name);

        if !repo.has_finalizer(GITREPO_FINALIZER) {
            return Ok(());
        }
        let finalizers: Vec<String> = repo
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != GITREPO_FINALIZER)
            .cloned()
            .collect();
        match self
            .collaborators
            .store
            .patch_gitrepo_finalizers(
                namespace,
                name,
                repo.metadata.resource_version.as_deref().unwrap_or_default(),
                finalizers,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(resource.name = name, resource.namespace = namespace, "GitRepo already gone");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("failed to remove finalizer").into()),
        }
    }
}
