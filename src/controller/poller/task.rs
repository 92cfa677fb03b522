//! One repo's polling task: resolve the remote commit and record it as the
//! repo's `pollingCommit`.

use super::TaskKey;
use crate::constants::{GIT_POLLING_CONDITION, STALLED_CONDITION};
use crate::controller::duration::polling_interval;
use crate::controller::update::{update_status, UpdateError};
use crate::controller::{fetch_latest_commit, Collaborators};
use crate::crd::{set_active, set_error, GitRepo, GitRepoStatus, HasConditions};
use crate::git::FetchError;
use crate::observability::metrics;
use crate::store::{EventKind, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("could not get GitRepo {0} from polling task")]
    NotFound(String),
    #[error("{source}")]
    Fetch {
        #[source]
        source: FetchError,
        /// Failure to record the fetch error in status, if any
        update: Option<UpdateError>,
    },
    #[error("could not update GitRepo status with polling result: {0}")]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a single execution did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another execution of this task was still running
    Overlapping,
    /// Polling disabled, or the interval has not elapsed since the last poll
    NotDue,
    Polled { commit: String },
}

/// Whether `repo` should be polled at `now`
#[must_use]
pub fn is_due(repo: &GitRepo, now: DateTime<Utc>, interval: Duration) -> bool {
    if repo.spec.disable_polling {
        return false;
    }
    let last = repo
        .status
        .as_ref()
        .and_then(|s| s.last_polling_time.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    match last {
        None => true,
        Some(last) => (now - last).to_std().is_ok_and(|elapsed| elapsed >= interval),
    }
}

/// Whether the repo is stalled by the last failed poll rather than by its job
fn is_stalled_by_poll(status: &GitRepoStatus) -> bool {
    status.is_condition_false(GIT_POLLING_CONDITION)
        && status.is_condition_true(STALLED_CONDITION)
        && status.condition_message(STALLED_CONDITION) == status.condition_message(GIT_POLLING_CONDITION)
}

pub struct PollingTask {
    key: TaskKey,
    collaborators: Collaborators,
    default_interval: Duration,
    max_attempts: u32,
    running: Semaphore,
}

impl std::fmt::Debug for PollingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingTask")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl PollingTask {
    #[must_use]
    pub fn new(key: TaskKey, collaborators: Collaborators, default_interval: Duration, max_attempts: u32) -> Self {
        Self {
            key,
            collaborators,
            default_interval,
            max_attempts,
            running: Semaphore::new(1),
        }
    }

    #[must_use]
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Run one poll unless another one for this repo is still in flight
    pub async fn execute(&self) -> Result<PollOutcome, PollError> {
        let Ok(_permit) = self.running.try_acquire() else {
            debug!(task = %self.key, "Skipping polling task execution: already running");
            metrics::increment_polling_skipped();
            return Ok(PollOutcome::Overlapping);
        };

        let span = info_span!(
            "gitrepo.poll",
            resource.name = self.key.name.as_str(),
            resource.namespace = self.key.namespace.as_str()
        );
        self.poll_git_repo().instrument(span).await
    }

    async fn poll_git_repo(&self) -> Result<PollOutcome, PollError> {
        let Collaborators {
            store,
            events,
            fetcher,
            clock,
        } = &self.collaborators;
        let (namespace, name) = (self.key.namespace.as_str(), self.key.name.as_str());

        let repo = store
            .get_gitrepo(namespace, name)
            .await?
            .ok_or_else(|| PollError::NotFound(format!("{namespace}/{name}")))?;

        let now = clock.now();
        if !is_due(&repo, now, polling_interval(&repo, self.default_interval)) {
            debug!("Polling not due yet");
            return Ok(PollOutcome::NotDue);
        }
        let polled_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        let commit = match fetch_latest_commit(fetcher.as_ref(), &repo).await {
            Ok(commit) => commit,
            Err(source) => {
                let message = source.to_string();
                warn!("Failed to check latest commit: {}", message);
                events
                    .record(&repo, EventKind::Warning, "FailedToCheckCommit", &message)
                    .await;
                let update = update_status(store.as_ref(), namespace, name, self.max_attempts, |status| {
                    status.set_condition_error(GIT_POLLING_CONDITION, "", Some(&message), now);
                    set_error(status, &message, now);
                    status.last_polling_time = Some(polled_at.clone());
                })
                .await
                .err();
                return Err(PollError::Fetch { source, update });
            }
        };

        if commit != repo.status_or_default().commit {
            events
                .record(&repo, EventKind::Normal, "GotNewCommit", &commit)
                .await;
        }

        let result = update_status(store.as_ref(), namespace, name, self.max_attempts, |status| {
            status.last_polling_time = Some(polled_at.clone());
            status.polling_commit.clone_from(&commit);
            let stalled_by_poll = is_stalled_by_poll(status);
            status.set_condition_error(GIT_POLLING_CONDITION, "", None, now);
            if stalled_by_poll {
                set_active(status, now);
            }
        })
        .await;
        if let Err(e) = result {
            let error = PollError::Update(e);
            events
                .record(&repo, EventKind::Warning, "FailedToCheckCommit", &error.to_string())
                .await;
            return Err(error);
        }

        debug!(commit = commit.as_str(), "Polled latest commit");
        Ok(PollOutcome::Polled { commit })
    }
}
