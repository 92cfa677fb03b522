//! # Apply Job Lifecycle Tests
//!
//! Integration tests driving the reconciler against the in-memory store.
//!
//! These tests verify:
//! - The first commit creates exactly one job named after it
//! - Completed jobs record `lastExecutedCommit` and are cleaned up
//! - The job status stays current once the completed job is gone
//! - Failed jobs stall the repo with the job's output
//! - Forced resyncs and spec changes replace the job
//! - A new commit supersedes the previous job
//! - Missing helm secrets deny the job until they appear
//! - Repos with polling disabled resolve their commit inline
//! - Deletion stops polling and releases the finalizer
//! - Error backoff history is dropped once a repo is gone

mod common;

use common::{gitrepo, Harness, NAMESPACE};
use gitops_controller::constants::{
    ACCEPTED_CONDITION, COMMIT_ANNOTATION, FORCE_SYNC_GENERATION_LABEL, GENERATION_LABEL, GITREPO_FINALIZER,
    GIT_POLLING_CONDITION, RECONCILING_CONDITION, STALLED_CONDITION,
};
use gitops_controller::controller::names::job_name_for_commit;
use gitops_controller::controller::reconciler::{reconcile, BackoffState, TriggerSource};
use gitops_controller::crd::HasConditions;
use gitops_controller::store::EventKind;
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus, Secret,
};
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::Arc;

fn finished(condition: &str, succeeded: i32, failed: i32) -> JobStatus {
    JobStatus {
        succeeded: Some(succeeded),
        failed: Some(failed),
        conditions: Some(vec![JobCondition {
            type_: condition.to_string(),
            status: "True".to_string(),
            ..JobCondition::default()
        }]),
        ..JobStatus::default()
    }
}

fn job_for(harness: &Harness, commit: &str) -> String {
    job_name_for_commit(&harness.repo("sample"), commit)
}

/// Repo with its first job created for commit `c1`
async fn repo_with_job() -> Harness {
    let harness = Harness::new("c1");
    harness.store.insert_gitrepo(gitrepo("sample"));
    let action = harness.reconcile_until_job("sample").await.unwrap();
    assert_eq!(action, Action::await_change());
    harness
}

#[tokio::test]
async fn test_first_commit_creates_job() {
    let harness = repo_with_job().await;

    let name = job_for(&harness, "c1");
    assert_eq!(harness.store.created_jobs(), vec![name.clone()]);
    let job = harness.store.job(NAMESPACE, &name).unwrap();
    let annotations = job.metadata.annotations.unwrap();
    assert_eq!(annotations[COMMIT_ANNOTATION], "c1");
    let labels = job.metadata.labels.unwrap();
    assert_eq!(labels[FORCE_SYNC_GENERATION_LABEL], "0");
    assert_eq!(labels[GENERATION_LABEL], "1");

    let repo = harness.repo("sample");
    assert!(repo.has_finalizer(GITREPO_FINALIZER));
    assert!(harness.store.has_service_account(NAMESPACE, "git-sample"));

    let status = repo.status_or_default();
    assert_eq!(status.commit, "c1");
    assert_eq!(status.polling_commit, "c1");
    assert_eq!(status.git_job_status, "InProgress");
    assert_eq!(status.observed_generation, 1);
    assert!(status.is_condition_true(ACCEPTED_CONDITION));
    assert!(status.is_condition_true(GIT_POLLING_CONDITION));

    let new_commit = harness.events.with_reason("GotNewCommit");
    assert_eq!(new_commit.len(), 1);
    assert_eq!(new_commit[0].message, "c1");
    assert_eq!(harness.events.with_reason("Created").len(), 1);
    assert_eq!(harness.fetcher.calls(), 1);
}

#[tokio::test]
async fn test_no_job_before_first_poll() {
    let harness = Harness::new("c1");
    harness.store.insert_gitrepo(gitrepo("sample"));

    let action = harness.reconcile("sample").await.unwrap();
    assert_eq!(action, Action::requeue(harness.reconciler.config.requeue_after()));
    assert!(harness.store.jobs().is_empty());
    assert_eq!(harness.reconciler.scheduler.len(), 1);
}

#[tokio::test]
async fn test_steady_state_creates_no_more_jobs() {
    let harness = repo_with_job().await;

    harness.reconcile("sample").await.unwrap();
    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.store.created_jobs().len(), 1);
    assert!(harness.store.deleted_jobs().is_empty());
}

#[tokio::test]
async fn test_completed_job_records_executed_commit() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");
    harness.store.set_job_status(NAMESPACE, &name, finished("Complete", 1, 0));

    let action = harness.reconcile("sample").await.unwrap();
    assert_eq!(action, Action::await_change());

    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.git_job_status, "Current");
    assert_eq!(status.last_executed_commit, "c1");
    assert!(status.is_condition_false(STALLED_CONDITION));
    assert_eq!(harness.store.deleted_jobs(), vec![name]);

    let deleted = harness.events.with_reason("JobDeleted");
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].kind, EventKind::Normal);
}

#[tokio::test]
async fn test_job_status_stays_current_after_cleanup() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");
    harness.store.set_job_status(NAMESPACE, &name, finished("Complete", 1, 0));
    harness.reconcile("sample").await.unwrap();
    let patches = harness.store.status_patches();

    for _ in 0..2 {
        let action = harness.reconcile("sample").await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.git_job_status, "Current");
    assert_eq!(status.last_executed_commit, "c1");
    assert!(status.is_condition_false(RECONCILING_CONDITION));
    assert!(status.is_condition_false(STALLED_CONDITION));
    assert_eq!(harness.store.created_jobs().len(), 1);
    assert_eq!(harness.store.status_patches(), patches);
}

#[tokio::test]
async fn test_failed_job_stalls_repo() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");
    harness.store.set_job_status(NAMESPACE, &name, finished("Failed", 0, 1));

    harness.reconcile("sample").await.unwrap();

    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.git_job_status, "Failed");
    assert!(status.is_condition_true(STALLED_CONDITION));
    assert_eq!(status.condition_message(STALLED_CONDITION), "Job Failed. failed: 1/1");
    assert_eq!(status.last_executed_commit, "");
    assert!(harness.store.deleted_jobs().is_empty());
}

#[tokio::test]
async fn test_failed_job_reports_pod_output() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");
    harness.store.set_job_status(NAMESPACE, &name, finished("Failed", 0, 1));

    let mut pod = Pod {
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "apply".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        message: Some(r#"{"level":"fatal","errorMessage":"chart not found"}"#.to_string()),
                        ..ContainerStateTerminated::default()
                    }),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }),
        ..Pod::default()
    };
    pod.metadata.namespace = Some(NAMESPACE.to_string());
    pod.metadata.labels = Some(BTreeMap::from([("job-name".to_string(), name)]));
    harness.store.add_pod(pod);

    harness.reconcile("sample").await.unwrap();

    let status = harness.repo("sample").status_or_default();
    assert_eq!(
        status.condition_message(STALLED_CONDITION),
        "Job Failed. failed: 1/1: chart not found"
    );
}

#[tokio::test]
async fn test_force_sync_recreates_job() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");
    let first_uid = harness.store.job(NAMESPACE, &name).unwrap().metadata.uid;

    harness
        .store
        .update_spec(NAMESPACE, "sample", |spec| spec.force_sync_generation = 1);

    let action = harness.reconcile("sample").await.unwrap();
    assert_eq!(action, Action::requeue(harness.reconciler.config.requeue_after()));
    assert!(harness.store.job(NAMESPACE, &name).is_none());
    assert_eq!(harness.store.deleted_jobs(), vec![name.clone()]);

    harness.reconcile("sample").await.unwrap();
    let job = harness.store.job(NAMESPACE, &name).unwrap();
    assert_ne!(job.metadata.uid, first_uid);
    assert_eq!(job.metadata.labels.unwrap()[FORCE_SYNC_GENERATION_LABEL], "1");

    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.update_generation, 1);
    assert_eq!(status.observed_generation, 2);

    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.store.created_jobs().len(), 2);
}

#[tokio::test]
async fn test_spec_change_recreates_job() {
    let harness = repo_with_job().await;
    let name = job_for(&harness, "c1");

    harness
        .store
        .update_spec(NAMESPACE, "sample", |spec| spec.paths = vec!["charts".to_string()]);

    harness.reconcile("sample").await.unwrap();
    assert!(harness.store.job(NAMESPACE, &name).is_none());

    harness.reconcile("sample").await.unwrap();
    let job = harness.store.job(NAMESPACE, &name).unwrap();
    assert_eq!(job.metadata.labels.unwrap()[GENERATION_LABEL], "2");
    assert_eq!(harness.repo("sample").status_or_default().observed_generation, 2);
}

#[tokio::test]
async fn test_new_commit_supersedes_previous_job() {
    let harness = repo_with_job().await;
    let previous = job_for(&harness, "c1");

    harness.fetcher.set_commit("c2");
    harness.clock.advance(chrono::Duration::seconds(15));
    let task = harness.reconciler.scheduler.task(NAMESPACE, "sample").unwrap();
    task.execute().await.unwrap();

    harness.reconcile("sample").await.unwrap();

    let current = job_for(&harness, "c2");
    assert_ne!(current, previous);
    assert_eq!(harness.store.deleted_jobs(), vec![previous]);
    assert!(harness.store.job(NAMESPACE, &current).is_some());
    assert_eq!(harness.repo("sample").status_or_default().commit, "c2");
}

#[tokio::test]
async fn test_job_names_follow_commit() {
    let repo = gitrepo("sample");
    let name = job_name_for_commit(&repo, "c1");
    assert_eq!(name, job_name_for_commit(&repo, "c1"));
    assert_ne!(name, job_name_for_commit(&repo, "c2"));
    assert!(name.starts_with("sample-"));
    assert!(name.len() <= 63);
}

#[tokio::test]
async fn test_missing_helm_secret_denies_job() {
    let harness = Harness::new("c1");
    let mut repo = gitrepo("sample");
    repo.spec.helm_secret_name = "helm-creds".to_string();
    harness.store.insert_gitrepo(repo);

    let error = harness.reconcile_until_job("sample").await.unwrap_err();
    assert!(error.is_denied());
    assert!(harness.store.jobs().is_empty());

    let status = harness.repo("sample").status_or_default();
    assert!(status.is_condition_false(ACCEPTED_CONDITION));
    assert!(status
        .condition_message(ACCEPTED_CONDITION)
        .contains("failed to look up helmSecretName"));
    let events = harness.events.with_reason("FailedValidatingSecret");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Warning);

    let mut secret = Secret::default();
    secret.metadata.name = Some("helm-creds".to_string());
    secret.metadata.namespace = Some(NAMESPACE.to_string());
    harness.store.add_secret(secret);

    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.store.jobs().len(), 1);
    assert!(harness
        .repo("sample")
        .status_or_default()
        .is_condition_true(ACCEPTED_CONDITION));
}

#[tokio::test]
async fn test_disabled_polling_fetches_inline() {
    let harness = Harness::new("c1");
    let mut repo = gitrepo("sample");
    repo.spec.disable_polling = true;
    harness.store.insert_gitrepo(repo);

    harness.reconcile("sample").await.unwrap();

    assert_eq!(harness.reconciler.scheduler.len(), 0);
    assert_eq!(harness.fetcher.calls(), 1);
    assert_eq!(harness.store.jobs().len(), 1);

    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.commit, "c1");
    assert!(status.polling_commit.is_empty());
    assert!(status.is_condition_true(GIT_POLLING_CONDITION));
    assert_eq!(harness.events.with_reason("GotNewCommit").len(), 1);
}

#[tokio::test]
async fn test_disabled_polling_fetch_failure() {
    let harness = Harness::new("c1");
    let mut repo = gitrepo("sample");
    repo.spec.disable_polling = true;
    harness.store.insert_gitrepo(repo);
    harness.fetcher.fail_next("connection refused");

    let error = harness.reconcile("sample").await.unwrap_err();
    assert!(!error.is_denied());
    assert!(error.to_string().contains("connection refused"));

    assert!(harness.store.jobs().is_empty());
    let status = harness.repo("sample").status_or_default();
    assert!(status.is_condition_false(GIT_POLLING_CONDITION));
    assert_eq!(
        status.condition_message(GIT_POLLING_CONDITION),
        "git ls-remote failed: connection refused"
    );
    assert!(status.is_condition_false(ACCEPTED_CONDITION));
    assert!(status.commit.is_empty());
    assert_eq!(harness.events.with_reason("FailedToCheckCommit").len(), 1);
}

#[tokio::test]
async fn test_disabled_polling_fetch_failure_is_retried() {
    let harness = Harness::new("c1");
    let mut repo = gitrepo("sample");
    repo.spec.disable_polling = true;
    harness.store.insert_gitrepo(repo);

    // a repeated failure writes nothing new, so only the error keeps it retrying
    harness.fetcher.fail_next("connection refused");
    assert!(harness.reconcile("sample").await.is_err());
    let patches = harness.store.status_patches();
    harness.fetcher.fail_next("connection refused");
    assert!(harness.reconcile("sample").await.is_err());
    assert_eq!(harness.store.status_patches(), patches);

    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.store.jobs().len(), 1);
    let status = harness.repo("sample").status_or_default();
    assert_eq!(status.commit, "c1");
    assert!(status.is_condition_true(GIT_POLLING_CONDITION));
    assert!(status.is_condition_true(ACCEPTED_CONDITION));
}

#[tokio::test]
async fn test_disabling_polling_removes_task() {
    let harness = repo_with_job().await;
    assert_eq!(harness.reconciler.scheduler.len(), 1);

    harness
        .store
        .update_spec(NAMESPACE, "sample", |spec| spec.disable_polling = true);
    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.reconciler.scheduler.len(), 0);
}

#[tokio::test]
async fn test_deletion_releases_repo() {
    let harness = repo_with_job().await;

    harness.store.mark_deleted(NAMESPACE, "sample");
    let action = harness.reconcile("sample").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(harness.reconciler.scheduler.len(), 0);
    assert!(!harness.store.has_gitrepo(NAMESPACE, "sample"));
}

#[tokio::test]
async fn test_missing_repo_drops_task() {
    let harness = Harness::new("c1");
    harness.store.insert_gitrepo(gitrepo("sample"));
    harness.reconcile("sample").await.unwrap();
    assert_eq!(harness.reconciler.scheduler.len(), 1);

    // the watch still hands out the last object it saw
    let stale = harness.repo("sample");
    harness.store.remove_gitrepo(NAMESPACE, "sample");

    let action = reconcile(Arc::new(stale), harness.reconciler.clone(), TriggerSource::Watch)
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    assert!(harness.reconciler.scheduler.is_empty());
}

fn record_failure(harness: &Harness, name: &str) {
    let mut state = BackoffState::new();
    state.increment_error();
    harness
        .reconciler
        .backoff_states
        .lock()
        .unwrap()
        .insert(format!("{NAMESPACE}/{name}"), state);
}

fn has_backoff(harness: &Harness, name: &str) -> bool {
    harness
        .reconciler
        .backoff_states
        .lock()
        .unwrap()
        .contains_key(&format!("{NAMESPACE}/{name}"))
}

#[tokio::test]
async fn test_deletion_forgets_backoff() {
    let harness = repo_with_job().await;
    record_failure(&harness, "sample");

    harness.store.mark_deleted(NAMESPACE, "sample");
    harness.reconcile("sample").await.unwrap();

    assert!(!has_backoff(&harness, "sample"));
}

#[tokio::test]
async fn test_missing_repo_forgets_backoff() {
    let harness = Harness::new("c1");
    harness.store.insert_gitrepo(gitrepo("sample"));
    harness.reconcile("sample").await.unwrap();
    record_failure(&harness, "sample");
    record_failure(&harness, "other");

    let stale = harness.repo("sample");
    harness.store.remove_gitrepo(NAMESPACE, "sample");
    reconcile(Arc::new(stale), harness.reconciler.clone(), TriggerSource::Watch)
        .await
        .unwrap();

    assert!(!has_backoff(&harness, "sample"));
    assert!(has_backoff(&harness, "other"));
}
