//! # Apply Job Lifecycle
//!
//! Decides, per reconcile, whether the repo's apply job must be created,
//! left alone or deleted, and folds the job's state into the GitRepo status.
//!
//! The job is named after the commit it applies, so a new commit always means
//! a new job. Jobs are immutable; a forced resync or a spec change deletes
//! the running job and the next pass creates its replacement.

mod build;
mod kstatus;

pub use build::{build_job, load_inputs, JobInputs};
pub use kstatus::{compute, filter_job_output, set_status_from_gitjob, JobPhase, JobStatus, PhaseCondition};

use crate::config::ControllerConfig;
use crate::constants::{CA_BUNDLE_FILE, FORCE_SYNC_GENERATION_LABEL, GENERATION_LABEL, GIT_POLLING_CONDITION};
use crate::controller::names::{ca_bundle_name, job_name, job_name_for_commit};
use crate::controller::rbac::{ensure_rbac, owned_metadata};
use crate::controller::{fetch_latest_commit, Collaborators};
use crate::crd::{GitRepo, HasConditions};
use crate::git::FetchError;
use crate::observability::metrics;
use crate::store::{EventKind, StoreError};
use base64::Engine;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("error retrieving git job: {0}")]
    GetJob(StoreError),
    #[error("error validating external secrets: {0}")]
    SecretValidation(String),
    #[error("failed to create RBAC resources for git job: {0}")]
    Rbac(StoreError),
    #[error("failed to create cabundle secret for git job: {0}")]
    CaBundle(String),
    #[error("error building git job: {0:#}")]
    Build(anyhow::Error),
    #[error("error creating git job: {0}")]
    Create(StoreError),
    #[error("error deleting git job: {0}")]
    Delete(StoreError),
    #[error("error setting GitRepo status from git job: {0}")]
    Status(StoreError),
    #[error("error fetching latest commit: {0}")]
    Fetch(FetchError),
}

impl JobError {
    /// Whether the job was refused because a referenced secret is missing
    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, JobError::SecretValidation(_))
    }
}

/// What the reconcile should do after the job was managed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Status reflects the job; continue with the rollup
    Done,
    /// A job was deleted for recreation; stop and come back later
    Requeue(Duration),
}

/// Whether a new job should be created for the repo's current state
///
/// Only meaningful when no job exists for the current commit. A repo
/// without a resolved commit never gets a job.
#[must_use]
pub fn should_create_job(repo: &GitRepo, old_commit: &str) -> bool {
    let status = repo.status_or_default();
    if status.commit.is_empty() {
        return false;
    }
    status.commit != old_commit
        || repo.spec.force_sync_generation != status.update_generation
        || repo.generation_changed()
}

/// Record the generation values a new job is created for
pub fn update_generation_values_if_needed(repo: &mut GitRepo) {
    let force_sync_generation = repo.spec.force_sync_generation;
    let generation_changed = repo.generation_changed();
    let generation = repo.generation();

    let status = repo.status_mut();
    if force_sync_generation != status.update_generation {
        status.update_generation = force_sync_generation;
    }
    if generation_changed {
        status.observed_generation = generation;
    }
}

fn job_label<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// Creates, deletes and observes the apply job of a GitRepo
#[derive(Debug, Clone)]
pub struct JobLifecycle {
    collaborators: Collaborators,
    config: Arc<ControllerConfig>,
}

impl JobLifecycle {
    #[must_use]
    pub fn new(collaborators: Collaborators, config: Arc<ControllerConfig>) -> Self {
        Self { collaborators, config }
    }

    /// Bring the apply job in line with `repo` and record its state in `repo.status`
    ///
    /// `old_commit` is the commit the repo carried before this reconcile
    /// resolved its next one.
    pub async fn manage_git_job(&self, repo: &mut GitRepo, old_commit: &str) -> Result<JobOutcome, JobError> {
        self.delete_previous_job(repo, old_commit).await?;

        let store = self.collaborators.store.as_ref();
        let namespace = repo.namespace_or_default().to_string();
        let name = job_name(repo);

        let existing = match store.get_job(&namespace, &name).await {
            Ok(job) => job,
            Err(e) => {
                let error = JobError::GetJob(e);
                self.collaborators
                    .events
                    .record(repo, EventKind::Warning, "FailedToGetGitJob", &error.to_string())
                    .await;
                return Err(error);
            }
        };

        let commit = repo.status_or_default().commit;
        let mut created = false;
        match &existing {
            None => {
                if repo.spec.disable_polling {
                    self.refresh_commit(repo, old_commit).await?;
                }

                if should_create_job(repo, old_commit) {
                    update_generation_values_if_needed(repo);
                    if let Err(e) = self.validate_external_secret_exist(repo).await {
                        self.collaborators
                            .events
                            .record(repo, EventKind::Warning, "FailedValidatingSecret", &e.to_string())
                            .await;
                        return Err(e);
                    }
                    if let Err(e) = self.create_job_and_resources(repo).await {
                        metrics::increment_job_creation_errors();
                        return Err(e);
                    }
                    metrics::increment_jobs_created();
                    created = true;
                }
            }
            Some(job) if !commit.is_empty() && commit == old_commit => {
                if self.delete_job_if_needed(repo, job).await? {
                    return Ok(JobOutcome::Requeue(self.config.requeue_after()));
                }
            }
            Some(_) => {}
        }

        let generation = repo.generation();
        repo.status_mut().observed_generation = generation;

        let observed = match existing {
            Some(job) => Some(job),
            // a job created in this pass has not been observed yet
            None if created => Some(Job::default()),
            // cleaned up after success; the last recorded state stands
            None => None,
        };
        if let Some(job) = observed {
            let now = self.collaborators.clock.now();
            set_status_from_gitjob(store, &namespace, repo.status_mut(), &job, now)
                .await
                .map_err(JobError::Status)?;
        }
        Ok(JobOutcome::Done)
    }

    /// Delete the job built for `old_commit` once the repo moved to another commit
    pub async fn delete_previous_job(&self, repo: &GitRepo, old_commit: &str) -> Result<(), JobError> {
        let commit = repo.status.as_ref().map(|s| s.commit.as_str()).unwrap_or_default();
        if old_commit.is_empty() || old_commit == commit {
            return Ok(());
        }

        let store = self.collaborators.store.as_ref();
        let namespace = repo.namespace_or_default();
        let previous = job_name_for_commit(repo, old_commit);
        if store.get_job(namespace, &previous).await.map_err(JobError::GetJob)?.is_none() {
            return Ok(());
        }

        info!(
            resource.name = repo.name(),
            resource.namespace = namespace,
            job = %previous,
            "Deleting previous job to avoid conflicts"
        );
        self.delete_job(namespace, &previous, "superseded").await
    }

    async fn delete_job(&self, namespace: &str, name: &str, reason: &str) -> Result<(), JobError> {
        match self.collaborators.store.delete_job(namespace, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(JobError::Delete(e)),
        }
        metrics::increment_job_deletions(reason);
        Ok(())
    }

    /// Delete `job` when it no longer matches the repo or has finished successfully
    ///
    /// Returns whether the job was deleted so that a replacement can be created.
    /// A succeeded job is cleaned up without asking for a replacement.
    pub async fn delete_job_if_needed(&self, repo: &GitRepo, job: &Job) -> Result<bool, JobError> {
        let namespace = repo.namespace_or_default();
        let name = job.metadata.name.as_deref().unwrap_or_default();
        let status = repo.status_or_default();

        if repo.spec.force_sync_generation != status.update_generation {
            let wanted = repo.spec.force_sync_generation.to_string();
            if job_label(job, FORCE_SYNC_GENERATION_LABEL).is_some_and(|label| label != wanted) {
                debug!(
                    resource.name = repo.name(),
                    resource.namespace = namespace,
                    job = name,
                    "job deletion triggered because of ForceUpdateGeneration"
                );
                self.delete_job(namespace, name, "force-sync").await?;
                return Ok(true);
            }
        }

        // jobs are immutable; a changed spec needs a new one
        if repo.generation_changed() {
            let wanted = repo.generation().to_string();
            if job_label(job, GENERATION_LABEL).is_some_and(|label| label != wanted) {
                debug!(
                    resource.name = repo.name(),
                    resource.namespace = namespace,
                    job = name,
                    "job deletion triggered because of generation change"
                );
                self.delete_job(namespace, name, "generation").await?;
                return Ok(true);
            }
        }

        if job.status.as_ref().and_then(|s| s.succeeded) == Some(1) {
            let message = "job deletion triggered because job succeeded";
            info!(resource.name = repo.name(), resource.namespace = namespace, job = name, "{}", message);
            self.delete_job(namespace, name, "succeeded").await?;
            self.collaborators
                .events
                .record(repo, EventKind::Normal, "JobDeleted", message)
                .await;
        }

        Ok(false)
    }

    /// Resolve the commit directly when the repo has no polling task
    ///
    /// The outcome is recorded in the `GitPolling` condition. A failed fetch
    /// fails the pass so that it is retried with backoff; no timer would
    /// retry it otherwise.
    async fn refresh_commit(&self, repo: &mut GitRepo, old_commit: &str) -> Result<(), JobError> {
        let result = fetch_latest_commit(self.collaborators.fetcher.as_ref(), repo).await;

        let error = result.as_ref().err().map(ToString::to_string);
        let now = self.collaborators.clock.now();
        let status = repo.status_mut();
        status.set_condition_error(GIT_POLLING_CONDITION, "", error.as_deref(), now);
        if let Ok(commit) = &result {
            if !commit.is_empty() {
                status.commit.clone_from(commit);
            }
        }
        let commit = status.commit.clone();

        let events = &self.collaborators.events;
        match result {
            Err(e) => {
                events
                    .record(repo, EventKind::Warning, "FailedToCheckCommit", &e.to_string())
                    .await;
                return Err(JobError::Fetch(e));
            }
            Ok(_) if commit != old_commit => {
                events.record(repo, EventKind::Normal, "GotNewCommit", &commit).await;
            }
            Ok(_) => {}
        }
        Ok(())
    }

    /// Make sure the helm credential secret the job will mount exists
    pub async fn validate_external_secret_exist(&self, repo: &GitRepo) -> Result<(), JobError> {
        let (secret_name, field) = if !repo.spec.helm_secret_name_for_paths.is_empty() {
            (&repo.spec.helm_secret_name_for_paths, "HelmSecretNameForPaths")
        } else if !repo.spec.helm_secret_name.is_empty() {
            (&repo.spec.helm_secret_name, "helmSecretName")
        } else {
            return Ok(());
        };

        let namespace = repo.namespace_or_default();
        let error = match self.collaborators.store.get_secret(namespace, secret_name).await {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => format!("secret \"{secret_name}\" not found"),
            Err(e) => e.to_string(),
        };
        Err(JobError::SecretValidation(format!(
            "failed to look up {field}, error: {error}"
        )))
    }

    async fn create_ca_bundle_secret(&self, repo: &GitRepo) -> Result<(), JobError> {
        let encoded = repo.spec.ca_bundle.trim();
        if encoded.is_empty() {
            return Ok(());
        }
        let bundle = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| JobError::CaBundle(format!("caBundle is not valid base64: {e}")))?;

        let secret = Secret {
            metadata: owned_metadata(repo, ca_bundle_name(repo)),
            data: Some(BTreeMap::from([(CA_BUNDLE_FILE.to_string(), ByteString(bundle))])),
            ..Secret::default()
        };
        self.collaborators
            .store
            .apply_secret(&secret)
            .await
            .map_err(|e| JobError::CaBundle(e.to_string()))
    }

    /// Provision everything the job needs, then the job itself
    pub async fn create_job_and_resources(&self, repo: &GitRepo) -> Result<(), JobError> {
        let store = self.collaborators.store.as_ref();
        debug!(
            resource.name = repo.name(),
            resource.namespace = repo.namespace_or_default(),
            "Creating Git job resources"
        );

        ensure_rbac(store, repo).await.map_err(JobError::Rbac)?;
        self.create_ca_bundle_secret(repo).await?;

        let inputs = load_inputs(store, &self.config, repo).await.map_err(JobError::Build)?;
        let job = build_job(&self.config, repo, &inputs);
        let created = store.create_job(&job).await.map_err(JobError::Create)?;

        info!(
            resource.name = repo.name(),
            resource.namespace = repo.namespace_or_default(),
            job = created.metadata.name.as_deref().unwrap_or_default(),
            commit = repo.status.as_ref().map(|s| s.commit.as_str()).unwrap_or_default(),
            "Created apply job"
        );
        self.collaborators
            .events
            .record(repo, EventKind::Normal, "Created", "GitJob was created")
            .await;
        Ok(())
    }
}
