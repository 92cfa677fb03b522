//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles reconciliation errors and watch stream errors.
//!
//! Reconcile failures reach the stream only after the error policy has
//! requeued them, so the stream classifies watch failures alone.

use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError, TriggerSource};
use crate::crd::GitRepo;
use crate::observability::metrics;
use kube_runtime::controller::{self, Action};
use kube_runtime::watcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay used when the backoff table cannot be read
const FALLBACK_BACKOFF_SECS: u64 = 60;

/// Error item of the controller stream
pub type StreamError = controller::Error<ReconcilerError, watcher::Error>;

/// Whether a stream error comes from the watches rather than from a reconcile
#[must_use]
pub fn is_watch_failure(error: &StreamError) -> bool {
    matches!(error, controller::Error::QueueError(_) | controller::Error::RunnerError(_))
}

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per resource so that one failing repo does not
/// slow down the retries of another. A successful pass resets it.
pub fn handle_reconciliation_error(obj: Arc<GitRepo>, error: &ReconcilerError, ctx: Arc<Reconciler>) -> Action {
    let name = obj.name();
    let namespace = obj.namespace_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    if error.is_denied() {
        warn!("Reconciliation denied for {}/{}: {}", namespace, name, error);
    } else {
        error!("Reconciliation error for {}/{}: {:?}", namespace, name, error);
    }
    metrics::increment_reconciliation_errors();

    let resource_key = format!("{namespace}/{name}");
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(resource_key).or_insert_with(BackoffState::new);
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (FALLBACK_BACKOFF_SECS, 0)
        }
    };

    info!(
        backoff_secs = backoff_seconds,
        error_count = error_count,
        trigger_source = TriggerSource::ErrorBackoff.as_str(),
        "Retrying with Fibonacci backoff"
    );

    metrics::increment_requeues_total(TriggerSource::ErrorBackoff.as_str());
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Classifies watch errors (401, 410, 429, not found) and waits where a
/// restart would otherwise spin.
///
/// Returns `None` to filter out the error (allow restart) or `Some(())` to continue.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay_secs: u64,
) -> Option<()> {
    let error_span = tracing::span!(tracing::Level::WARN, "controller.watch.error", error = %error_string);
    let _error_guard = error_span.enter();

    // 404 first: a plain-text 404 body surfaces as a serde error mentioning WatchFailed
    let is_not_found =
        error_string.contains("ObjectNotFound") || error_string.contains("404") || error_string.contains("not found");
    let is_401 = (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found;
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");

    if is_401 {
        error!("Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired");
        error!("Diagnostics:");
        error!("   1. Verify the controller ClusterRole and ClusterRoleBinding still exist");
        error!("   2. Verify the controller ServiceAccount still exists and its token is valid");
        error!("   3. Check access: kubectl auth can-i list gitrepos.gitops.octopilot.io --as=system:serviceaccount:<namespace>:<account> --all-namespaces");
        error!("   4. If RBAC was recently changed, restart the controller pod");
        warn!(
            "Waiting {}s before retrying watch (RBAC may need time to propagate)...",
            watch_restart_delay_secs
        );
        tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
        None
    } else if is_410 {
        warn!(
            error_type = "410",
            "Watch resource version expired (410) - this is normal during pod restarts, watch will restart"
        );
        None
    } else if is_429 {
        let current_backoff = backoff.load(Ordering::Relaxed);
        warn!(
            "API server storage reinitializing (429), backing off for {}ms before restart...",
            current_backoff
        );
        tokio::time::sleep(Duration::from_millis(current_backoff)).await;
        backoff.store(current_backoff.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
        None
    } else if is_not_found {
        let resource_info = if error_string.contains("integer `404`") {
            "CRD or resource may have been deleted (404 returned as plain text)"
        } else if error_string.contains("GitRepo") {
            "GitRepo resource"
        } else if error_string.contains("BundleDeployment") {
            "BundleDeployment resource"
        } else {
            "Resource"
        };
        warn!(
            "{} not found (404) - this may be normal if resource was deleted or CRD is missing. Error: {}",
            resource_info, error_string
        );
        Some(())
    } else {
        error!("Controller stream error: {}", error_string);
        tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_runtime::reflector::ObjectRef;

    #[test]
    fn test_reconcile_failures_are_not_watch_failures() {
        let object = ObjectRef::<GitRepo>::new("sample").within("fleet-local").erase();

        // the reconcile error text would otherwise read as a 404
        let failed: StreamError = controller::Error::ReconcilerFailed(
            ReconcilerError::ReconciliationFailed(anyhow::anyhow!("GitRepo not found")),
            object.clone(),
        );
        assert!(!is_watch_failure(&failed));

        let missing: StreamError = controller::Error::ObjectNotFound(object);
        assert!(!is_watch_failure(&missing));

        let queue: StreamError = controller::Error::QueueError(watcher::Error::NoResourceVersion);
        assert!(is_watch_failure(&queue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_doubles_backoff_up_to_max() {
        let backoff = Arc::new(AtomicU64::new(1000));
        assert!(handle_watch_stream_error("429 TooManyRequests", &backoff, 1500, 1).await.is_none());
        assert_eq!(backoff.load(Ordering::Relaxed), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_continues() {
        let backoff = Arc::new(AtomicU64::new(1000));
        assert!(handle_watch_stream_error("GitRepo not found", &backoff, 1500, 1).await.is_some());
        assert_eq!(backoff.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_restarts() {
        let backoff = Arc::new(AtomicU64::new(1000));
        assert!(handle_watch_stream_error("410 Gone: too old resource version", &backoff, 1500, 1)
            .await
            .is_none());
    }
}
