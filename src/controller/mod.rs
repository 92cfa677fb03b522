//! # Controller
//!
//! Core controller modules for the GitOps controller.
//!
//! - `backoff`: Fibonacci backoff for reconcile errors
//! - `duration`: polling interval parsing
//! - `job`: apply job lifecycle and construction
//! - `names`: deterministic names of derived objects
//! - `poller`: per-repo polling tasks
//! - `rbac`: identity the apply job runs as
//! - `reconciler`: the GitRepo reconcile loop
//! - `restrictions`: namespace policies applied to GitRepos
//! - `status`: bundle deployment rollup and status conditions
//! - `update`: optimistic read-mutate-write of GitRepo status

pub mod backoff;
pub mod duration;
pub mod job;
pub mod names;
pub mod poller;
pub mod rbac;
pub mod reconciler;
pub mod restrictions;
pub mod status;
pub mod update;

use crate::clock::Clock;
use crate::crd::GitRepo;
use crate::git::{FetchError, GitFetcher};
use crate::observability::metrics;
use crate::store::{EventRecorder, ObjectStore};
use std::sync::Arc;
use std::time::Instant;

/// External services shared by the reconciler and the polling tasks
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventRecorder>,
    pub fetcher: Arc<dyn GitFetcher>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Resolve the repo's latest commit, recording fetch metrics
pub(crate) async fn fetch_latest_commit(fetcher: &dyn GitFetcher, repo: &GitRepo) -> Result<String, FetchError> {
    let start = Instant::now();
    let result = fetcher.latest_commit(repo).await;
    metrics::record_commit_fetch(result.is_ok(), start.elapsed().as_secs_f64());
    result
}
