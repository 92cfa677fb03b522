//! Common test utilities for controller integration tests
//!
//! Provides an in-memory object store with resource versions, a recording
//! event sink, a scripted git fetcher and a harness wiring them into a
//! reconciler.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gitops_controller::clock::ManualClock;
use gitops_controller::config::ControllerConfig;
use gitops_controller::constants::{BUNDLE_NAMESPACE_LABEL, REPO_LABEL};
use gitops_controller::controller::reconciler::{reconcile, Reconciler, ReconcilerError, TriggerSource};
use gitops_controller::controller::Collaborators;
use gitops_controller::crd::{BundleDeployment, GitRepo, GitRepoRestriction, GitRepoSpec, GitRepoStatus};
use gitops_controller::git::{FetchError, GitFetcher};
use gitops_controller::store::{apply_merge_patch, EventKind, EventRecorder, ObjectStore, StoreError};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const NAMESPACE: &str = "fleet-local";
pub const REPO_URL: &str = "https://github.com/example/apps";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    next_version: u64,
    repos: BTreeMap<Key, GitRepo>,
    restrictions: Vec<GitRepoRestriction>,
    bundle_deployments: Vec<BundleDeployment>,
    jobs: BTreeMap<Key, Job>,
    created_jobs: Vec<String>,
    deleted_jobs: Vec<String>,
    pods: Vec<Pod>,
    secrets: BTreeMap<Key, Secret>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    roles: BTreeMap<Key, Role>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    deployments: BTreeMap<Key, Deployment>,
    injected_status_conflicts: u32,
    concurrent_writer: Option<StatusEdit>,
    status_patches: u32,
}

type StatusEdit = Box<dyn FnOnce(&mut GitRepoStatus) + Send>;

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory cluster API with optimistic concurrency on GitRepos
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    /// Store holding the controller deployment the apply jobs copy tolerations from
    pub fn new() -> Self {
        let store = Self {
            state: Mutex::new(State::default()),
        };
        let config = ControllerConfig::default();
        let mut deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec::default()),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        deployment.metadata.name = Some(config.controller_deployment_name.clone());
        deployment.metadata.namespace = Some(config.controller_namespace.clone());
        store.lock().deployments.insert(
            key(&config.controller_namespace, &config.controller_deployment_name),
            deployment,
        );
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_gitrepo(&self, mut repo: GitRepo) -> GitRepo {
        let mut state = self.lock();
        repo.metadata.resource_version = Some(state.bump());
        let uid = format!("uid-{}", repo.name());
        repo.metadata.uid.get_or_insert(uid);
        repo.metadata.generation.get_or_insert(1);
        state
            .repos
            .insert(key(repo.namespace_or_default(), repo.name()), repo.clone());
        repo
    }

    pub fn gitrepo(&self, namespace: &str, name: &str) -> GitRepo {
        self.lock().repos.get(&key(namespace, name)).cloned().unwrap()
    }

    pub fn has_gitrepo(&self, namespace: &str, name: &str) -> bool {
        self.lock().repos.contains_key(&key(namespace, name))
    }

    /// Edit the spec the way a user would, bumping the generation
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut GitRepoSpec)) {
        let mut state = self.lock();
        let version = state.bump();
        let repo = state.repos.get_mut(&key(namespace, name)).unwrap();
        edit(&mut repo.spec);
        repo.metadata.generation = Some(repo.generation() + 1);
        repo.metadata.resource_version = Some(version);
    }

    /// Write status fields directly, as another writer would
    pub fn edit_status(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut GitRepoStatus)) {
        let mut state = self.lock();
        let version = state.bump();
        let repo = state.repos.get_mut(&key(namespace, name)).unwrap();
        edit(repo.status_mut());
        repo.metadata.resource_version = Some(version);
    }

    pub fn remove_gitrepo(&self, namespace: &str, name: &str) {
        self.lock().repos.remove(&key(namespace, name));
    }

    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let version = state.bump();
        let repo = state.repos.get_mut(&key(namespace, name)).unwrap();
        repo.metadata.deletion_timestamp = Some(Time(Utc::now()));
        repo.metadata.resource_version = Some(version);
    }

    pub fn add_restriction(&self, restriction: GitRepoRestriction) {
        self.lock().restrictions.push(restriction);
    }

    pub fn add_bundle_deployment(&self, deployment: BundleDeployment) {
        self.lock().bundle_deployments.push(deployment);
    }

    pub fn add_secret(&self, secret: Secret) {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.lock().secrets.insert(key(&namespace, &name), secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.push(pod);
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.lock().jobs.get(&key(namespace, name)).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn set_job_status(&self, namespace: &str, name: &str, status: JobStatus) {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&key(namespace, name)).unwrap();
        job.status = Some(status);
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.lock().created_jobs.clone()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        self.lock().deleted_jobs.clone()
    }

    pub fn has_service_account(&self, namespace: &str, name: &str) -> bool {
        self.lock().service_accounts.contains_key(&key(namespace, name))
    }

    /// Fail the next `n` status patches as if another writer got there first
    pub fn inject_status_conflicts(&self, n: u32) {
        self.lock().injected_status_conflicts = n;
    }

    /// Let another writer edit the status just before the next status patch lands
    pub fn write_concurrently(&self, edit: impl FnOnce(&mut GitRepoStatus) + Send + 'static) {
        self.lock().concurrent_writer = Some(Box::new(edit));
    }

    pub fn status_patches(&self) -> u32 {
        self.lock().status_patches
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_gitrepo(&self, namespace: &str, name: &str) -> Result<Option<GitRepo>, StoreError> {
        Ok(self.lock().repos.get(&key(namespace, name)).cloned())
    }

    async fn patch_gitrepo_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        patch: serde_json::Value,
    ) -> Result<GitRepo, StoreError> {
        let mut state = self.lock();
        let current = state
            .repos
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;

        if let Some(edit) = state.concurrent_writer.take() {
            let version = state.bump();
            if let Some(repo) = state.repos.get_mut(&key(namespace, name)) {
                edit(repo.status_mut());
                repo.metadata.resource_version = Some(version);
            }
            return Err(StoreError::Conflict(format!("{namespace}/{name}")));
        }
        if state.injected_status_conflicts > 0 {
            state.injected_status_conflicts -= 1;
            let version = state.bump();
            if let Some(repo) = state.repos.get_mut(&key(namespace, name)) {
                repo.metadata.resource_version = Some(version);
            }
            return Err(StoreError::Conflict(format!("{namespace}/{name}")));
        }
        if current.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(StoreError::Conflict(format!("{namespace}/{name}")));
        }

        let mut value = serde_json::to_value(&current).unwrap();
        apply_merge_patch(&mut value, &patch);
        let mut updated: GitRepo = serde_json::from_value(value).unwrap();
        updated.metadata.resource_version = Some(state.bump());
        state.status_patches += 1;
        state.repos.insert(key(namespace, name), updated.clone());
        Ok(updated)
    }

    async fn patch_gitrepo_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let version = state.bump();
        let repo = state
            .repos
            .get_mut(&key(namespace, name))
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;
        if repo.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(StoreError::Conflict(format!("{namespace}/{name}")));
        }
        let released = repo.metadata.deletion_timestamp.is_some() && finalizers.is_empty();
        repo.metadata.finalizers = Some(finalizers);
        repo.metadata.resource_version = Some(version);
        if released {
            state.repos.remove(&key(namespace, name));
        }
        Ok(())
    }

    async fn list_restrictions(&self, namespace: &str) -> Result<Vec<GitRepoRestriction>, StoreError> {
        Ok(self
            .lock()
            .restrictions
            .iter()
            .filter(|r| r.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn list_bundle_deployments(
        &self,
        repo_namespace: &str,
        repo_name: &str,
    ) -> Result<Vec<BundleDeployment>, StoreError> {
        Ok(self
            .lock()
            .bundle_deployments
            .iter()
            .filter(|bd| {
                let labels = bd.metadata.labels.clone().unwrap_or_default();
                labels.get(REPO_LABEL).map(String::as_str) == Some(repo_name)
                    && labels.get(BUNDLE_NAMESPACE_LABEL).map(String::as_str) == Some(repo_namespace)
            })
            .cloned()
            .collect())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&key(namespace, name)).cloned())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut state = self.lock();
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        let name = job.metadata.name.clone().unwrap_or_default();
        if state.jobs.contains_key(&key(&namespace, &name)) {
            return Err(StoreError::AlreadyExists(name));
        }
        let mut created = job.clone();
        let version = state.bump();
        created.metadata.uid = Some(format!("job-uid-{version}"));
        created.metadata.resource_version = Some(version);
        state.created_jobs.push(name.clone());
        state.jobs.insert(key(&namespace, &name), created.clone());
        Ok(created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .jobs
            .remove(&key(namespace, name))
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))?;
        state.deleted_jobs.push(name.to_string());
        Ok(())
    }

    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>, StoreError> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get("job-name"))
                        .map(String::as_str)
                        == Some(job_name)
            })
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        self.add_secret(secret.clone());
        Ok(())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError> {
        let mut state = self.lock();
        let namespace = account.metadata.namespace.clone().unwrap_or_default();
        let name = account.metadata.name.clone().unwrap_or_default();
        if state.service_accounts.contains_key(&key(&namespace, &name)) {
            return Err(StoreError::AlreadyExists(name));
        }
        state.service_accounts.insert(key(&namespace, &name), account.clone());
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<(), StoreError> {
        let namespace = role.metadata.namespace.clone().unwrap_or_default();
        let name = role.metadata.name.clone().unwrap_or_default();
        self.lock().roles.insert(key(&namespace, &name), role.clone());
        Ok(())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError> {
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.lock().role_bindings.insert(key(&namespace, &name), binding.clone());
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.lock().deployments.get(&key(namespace, name)).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// Event sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.reason == reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, _repo: &GitRepo, kind: EventKind, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Fetcher answering from a script, then with its current commit
pub struct ScriptedFetcher {
    commit: Mutex<String>,
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedFetcher {
    pub fn returning(commit: &str) -> Self {
        Self {
            commit: Mutex::new(commit.to_string()),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Fetcher whose calls wait until the returned gate is notified
    pub fn gated(commit: &str) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut fetcher = Self::returning(commit);
        fetcher.gate = Some(gate.clone());
        (fetcher, gate)
    }

    pub fn set_commit(&self, commit: &str) {
        *self.commit.lock().unwrap() = commit.to_string();
    }

    pub fn fail_next(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitFetcher for ScriptedFetcher {
    async fn latest_commit(&self, _repo: &GitRepo) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(commit)) => Ok(commit),
            Some(Err(message)) => Err(FetchError::Command(message)),
            None => Ok(self.commit.lock().unwrap().clone()),
        }
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn gitrepo(name: &str) -> GitRepo {
    let mut repo = GitRepo::new(
        name,
        GitRepoSpec {
            repo: REPO_URL.to_string(),
            ..GitRepoSpec::default()
        },
    );
    repo.metadata.namespace = Some(NAMESPACE.to_string());
    repo
}

/// Fakes wired into a reconciler
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub events: Arc<RecordingEvents>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub clock: Arc<ManualClock>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    /// Must be created inside a tokio runtime; the scheduler spawns timers
    pub fn new(commit: &str) -> Self {
        Self::with_fetcher(ScriptedFetcher::returning(commit))
    }

    pub fn with_fetcher(fetcher: ScriptedFetcher) -> Self {
        let store = Arc::new(FakeStore::new());
        let events = Arc::new(RecordingEvents::default());
        let fetcher = Arc::new(fetcher);
        let clock = Arc::new(ManualClock::new(start_time()));
        let collaborators = Collaborators {
            store: store.clone(),
            events: events.clone(),
            fetcher: fetcher.clone(),
            clock: clock.clone(),
        };
        let reconciler = Arc::new(Reconciler::new(collaborators, ControllerConfig::default()));
        Self {
            store,
            events,
            fetcher,
            clock,
            reconciler,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.reconciler.collaborators.clone()
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcilerError> {
        let repo = self.store.gitrepo(NAMESPACE, name);
        reconcile(Arc::new(repo), self.reconciler.clone(), TriggerSource::Watch).await
    }

    /// Let spawned polling timers run their immediate first fire
    pub async fn settle(&self) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    /// Register the repo, let its first poll land and reconcile again
    pub async fn reconcile_until_job(&self, name: &str) -> Result<Action, ReconcilerError> {
        let first = self.reconcile(name).await?;
        assert_eq!(first, Action::requeue(self.reconciler.config.requeue_after()));
        self.settle().await;
        self.reconcile(name).await
    }

    pub fn repo(&self, name: &str) -> GitRepo {
        self.store.gitrepo(NAMESPACE, name)
    }
}
