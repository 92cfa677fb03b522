//! # Types
//!
//! Core types for the reconciler.

use crate::config::ControllerConfig;
use crate::constants::{DEFAULT_ERROR_BACKOFF_MAX_SECS, DEFAULT_ERROR_BACKOFF_MIN_SECS};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::job::{JobError, JobLifecycle};
use crate::controller::poller::PollingScheduler;
use crate::controller::restrictions::RestrictionError;
use crate::controller::update::UpdateError;
use crate::controller::Collaborators;
use crate::store::StoreError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Restriction(#[from] RestrictionError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    /// The pass failed and recording the failure in the status failed as well
    #[error("{error}; failed to update the status: {update}")]
    StatusNotRecorded {
        error: Box<ReconcilerError>,
        update: UpdateError,
    },
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

impl ReconcilerError {
    /// Whether the failure is a policy or validation denial rather than an infrastructure error
    #[must_use]
    pub fn is_denied(&self) -> bool {
        match self {
            ReconcilerError::Restriction(e) => e.is_denied(),
            ReconcilerError::Job(e) => e.is_denied(),
            ReconcilerError::StatusNotRecorded { error, .. } => error.is_denied(),
            _ => false,
        }
    }
}

/// Trigger source for reconciliation
/// Tracks why a reconciliation was triggered for better debugging and observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// GitRepo, owned Job or BundleDeployment change seen by the watch
    Watch,
    /// Requeue after a polling registration or a job deletion
    Requeue,
    /// Error backoff retry (Fibonacci backoff after failure)
    ErrorBackoff,
}

impl TriggerSource {
    /// Get human-readable string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Watch => "watch",
            TriggerSource::Requeue => "requeue",
            TriggerSource::ErrorBackoff => "error-backoff",
        }
    }
}

/// Backoff state for a specific resource
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(DEFAULT_ERROR_BACKOFF_MIN_SECS, DEFAULT_ERROR_BACKOFF_MAX_SECS),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context of every reconcile
#[derive(Clone)]
pub struct Reconciler {
    pub collaborators: Collaborators,
    pub scheduler: Arc<PollingScheduler>,
    pub jobs: JobLifecycle,
    pub config: Arc<ControllerConfig>,
    // Backoff state per resource (identified by namespace/name), owned by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler with its own polling scheduler built from `config`
    #[must_use]
    pub fn new(collaborators: Collaborators, config: ControllerConfig) -> Self {
        let scheduler = Arc::new(PollingScheduler::new(
            collaborators.clone(),
            config.default_polling_interval(),
            config.polling_jitter_percent,
            config.status_update_max_attempts,
        ));
        Self::with_scheduler(collaborators, config, scheduler)
    }

    #[must_use]
    pub fn with_scheduler(collaborators: Collaborators, config: ControllerConfig, scheduler: Arc<PollingScheduler>) -> Self {
        let config = Arc::new(config);
        Self {
            jobs: JobLifecycle::new(collaborators.clone(), Arc::clone(&config)),
            collaborators,
            scheduler,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forget the error history of a resource after a successful pass
    pub fn reset_backoff(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        let mut states = match self.backoff_states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(state) = states.get_mut(&key) {
            state.reset();
        }
    }

    /// Drop the error history of a resource that no longer exists
    pub fn forget_backoff(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        let mut states = match self.backoff_states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.remove(&key);
    }
}
