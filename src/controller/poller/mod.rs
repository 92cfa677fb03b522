//! # Polling Scheduler
//!
//! One recurring polling task per GitRepo, held in a table keyed by
//! namespace and name.
//!
//! A task fires immediately when registered and then every
//! `interval + jitter`. Its key also carries the repo URL and branch, so a
//! change to either (or to the interval) replaces the task. Removing a task
//! aborts its timer; a poll in flight at that moment is dropped.

mod jitter;
mod task;

pub use jitter::jitter;
pub use task::{is_due, PollError, PollOutcome, PollingTask};

use crate::controller::duration::polling_interval;
use crate::controller::Collaborators;
use crate::crd::GitRepo;
use crate::observability::metrics;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of a polling task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub namespace: String,
    pub name: String,
    pub repo: String,
    pub branch: String,
}

impl TaskKey {
    #[must_use]
    pub fn for_repo(repo: &GitRepo) -> Self {
        Self {
            namespace: repo.namespace_or_default().to_string(),
            name: repo.name().to_string(),
            repo: repo.spec.repo.clone(),
            branch: repo.spec.branch.clone(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gitops-polling-{}-{}-{}-{}",
            self.namespace, self.name, self.repo, self.branch
        )
    }
}

/// Result of [`PollingScheduler::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Replaced,
    Unchanged,
}

impl Registration {
    /// Whether a new task was started
    #[must_use]
    pub fn is_new(self) -> bool {
        !matches!(self, Registration::Unchanged)
    }
}

struct ScheduledTask {
    task: Arc<PollingTask>,
    interval: Duration,
    timer: JoinHandle<()>,
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

type SharedRng = Arc<Mutex<Box<dyn RngCore + Send>>>;

pub struct PollingScheduler {
    collaborators: Collaborators,
    default_interval: Duration,
    jitter_percent: u32,
    max_attempts: u32,
    rng: SharedRng,
    tasks: Mutex<HashMap<(String, String), ScheduledTask>>,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("default_interval", &self.default_interval)
            .field("jitter_percent", &self.jitter_percent)
            .field("tasks", &self.len())
            .finish_non_exhaustive()
    }
}

impl PollingScheduler {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        default_interval: Duration,
        jitter_percent: u32,
        max_attempts: u32,
    ) -> Self {
        Self::with_rng(
            collaborators,
            default_interval,
            jitter_percent,
            max_attempts,
            Box::new(StdRng::from_entropy()),
        )
    }

    /// Scheduler drawing its jitter from `rng`
    #[must_use]
    pub fn with_rng(
        collaborators: Collaborators,
        default_interval: Duration,
        jitter_percent: u32,
        max_attempts: u32,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            collaborators,
            default_interval,
            jitter_percent,
            max_attempts,
            rng: Arc::new(Mutex::new(rng)),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut HashMap<(String, String), ScheduledTask>) -> T) -> T {
        match self.tasks.lock() {
            Ok(mut tasks) => f(&mut tasks),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Register the repo's polling task, replacing it when its key or interval changed
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure(&self, repo: &GitRepo) -> Registration {
        let key = TaskKey::for_repo(repo);
        let interval = polling_interval(repo, self.default_interval);

        let registration = self.with_tasks(|tasks| {
            let slot = (key.namespace.clone(), key.name.clone());
            let registration = match tasks.get(&slot) {
                Some(existing) if existing.task.key() == &key && existing.interval == interval => {
                    return Registration::Unchanged;
                }
                Some(_) => Registration::Replaced,
                None => Registration::Created,
            };

            let task = Arc::new(PollingTask::new(
                key.clone(),
                self.collaborators.clone(),
                self.default_interval,
                self.max_attempts,
            ));
            let timer = spawn_timer(task.clone(), interval, self.jitter_percent, self.rng.clone());
            // replacing drops, and so aborts, the previous timer
            tasks.insert(slot, ScheduledTask { task, interval, timer });
            metrics::set_polling_tasks(tasks.len());
            registration
        });

        if registration.is_new() {
            info!(
                resource.name = key.name.as_str(),
                resource.namespace = key.namespace.as_str(),
                interval_secs = interval.as_secs(),
                "Scheduled polling task ({:?})",
                registration
            );
        }
        registration
    }

    /// Remove the repo's polling task; returns whether one existed
    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        let removed = self.with_tasks(|tasks| {
            let removed = tasks.remove(&(namespace.to_string(), name.to_string()));
            metrics::set_polling_tasks(tasks.len());
            removed
        });
        if removed.is_some() {
            debug!(
                resource.name = name,
                resource.namespace = namespace,
                "Removed polling task"
            );
        }
        removed.is_some()
    }

    /// The registered task for a repo, if any
    #[must_use]
    pub fn task(&self, namespace: &str, name: &str) -> Option<Arc<PollingTask>> {
        self.with_tasks(|tasks| {
            tasks
                .get(&(namespace.to_string(), name.to_string()))
                .map(|scheduled| scheduled.task.clone())
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_tasks(|tasks| tasks.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task
    pub fn shutdown(&self) {
        self.with_tasks(HashMap::clear);
        metrics::set_polling_tasks(0);
    }
}

fn next_delay(interval: Duration, jitter_percent: u32, rng: &SharedRng) -> Duration {
    let extra = match rng.lock() {
        Ok(mut rng) => jitter(interval, jitter_percent, &mut **rng),
        Err(poisoned) => jitter(interval, jitter_percent, &mut **poisoned.into_inner()),
    };
    interval + extra
}

fn spawn_timer(task: Arc<PollingTask>, interval: Duration, jitter_percent: u32, rng: SharedRng) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match task.execute().await {
                Ok(outcome) => debug!(task = %task.key(), ?outcome, "Polling task fired"),
                Err(e) => warn!(task = %task.key(), "Polling task failed: {}", e),
            }
            tokio::time::sleep(next_delay(interval, jitter_percent, &rng)).await;
        }
    })
}
