//! # Reconciliation Logic
//!
//! One pass over a GitRepo: authorize it, keep its polling task registered,
//! drive the apply job for the resolved commit and roll the bundle
//! deployments up into its status.
//!
//! The object handed in by the watch is only a key; every pass starts from a
//! fresh read so that commits written by the poller are seen.

mod finalize;

pub use finalize::apply_reconciled_fields;

use crate::constants::GIT_POLLING_CONDITION;
use crate::controller::job::JobOutcome;
use crate::controller::names::next_commit;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError, TriggerSource};
use crate::controller::restrictions::authorize_and_assign_defaults;
use crate::controller::status::{set_accepted, set_status_from_bundle_deployments};
use crate::crd::{GitRepo, GitRepoStatus};
use crate::observability::metrics;
use crate::store::EventKind;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Main reconciliation function
///
/// Errors are turned into requeues by the error policy of the runtime.
pub async fn reconcile(
    obj: Arc<GitRepo>,
    ctx: Arc<Reconciler>,
    trigger_source: TriggerSource,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let span = info_span!(
        "controller.reconcile",
        resource.name = obj.name(),
        resource.namespace = obj.namespace_or_default(),
        trigger = trigger_source.as_str(),
    );
    let result = reconcile_repo(&obj, &ctx).instrument(span).await;

    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
    result
}

async fn reconcile_repo(obj: &GitRepo, ctx: &Reconciler) -> Result<Action, ReconcilerError> {
    let (namespace, name) = (obj.namespace_or_default(), obj.name());
    let store = ctx.collaborators.store.as_ref();

    let Some(mut repo) = store.get_gitrepo(namespace, name).await? else {
        debug!("GitRepo not found, removing polling task");
        ctx.scheduler.remove(namespace, name);
        ctx.forget_backoff(namespace, name);
        return Ok(Action::await_change());
    };

    if repo.is_being_deleted() {
        ctx.handle_delete(&repo).await?;
        return Ok(Action::await_change());
    }

    let old_status = repo.status_or_default();
    if let Err(e) = authorize_and_assign_defaults(store, &mut repo).await {
        warn!(error = %e, "GitRepo rejected by restrictions");
        ctx.collaborators
            .events
            .record(&repo, EventKind::Warning, "FailedToApplyRestrictions", &e.to_string())
            .await;
        return Err(ctx.update_error_status(&repo, old_status, e.into()).await);
    }

    ctx.ensure_finalizer(&repo).await?;

    if repo.spec.repo.is_empty() {
        ctx.scheduler.remove(namespace, name);
        return Ok(Action::await_change());
    }

    if repo.spec.disable_polling {
        ctx.scheduler.remove(namespace, name);
    } else if ctx.scheduler.ensure(&repo).is_new() {
        // the first poll runs now; pick its commit up on the next pass
        metrics::increment_requeues_total(TriggerSource::Requeue.as_str());
        return Ok(Action::requeue(ctx.config.requeue_after()));
    }

    let old_commit = repo.status_or_default().commit;
    let commit = next_commit(&repo.status_or_default());
    repo.status_mut().commit = commit;

    match ctx.jobs.manage_git_job(&mut repo, &old_commit).await {
        Ok(JobOutcome::Done) => {}
        Ok(JobOutcome::Requeue(after)) => {
            ctx.update_accepted_status(&repo, repo.status_or_default()).await?;
            metrics::increment_requeues_total(TriggerSource::Requeue.as_str());
            return Ok(Action::requeue(after));
        }
        Err(e) => {
            // keep the commit and generations unrecorded so the next pass retries the job
            let mut status = old_status;
            if repo.spec.disable_polling {
                carry_condition(&repo.status_or_default(), &mut status, GIT_POLLING_CONDITION);
            }
            return Err(ctx.update_error_status(&repo, status, e.into()).await);
        }
    }

    let now = ctx.collaborators.clock.now();
    set_status_from_bundle_deployments(store, &mut repo, now).await?;

    let mut status = repo.status_or_default();
    set_accepted(&mut status, None, now);
    ctx.write_status(&repo, &status).await?;

    info!(
        commit = %status.commit,
        git_job_status = %status.git_job_status,
        ready = %status.display.ready_bundle_deployments,
        "Reconciled GitRepo"
    );
    ctx.reset_backoff(namespace, name);
    Ok(Action::await_change())
}

/// Copy the `condition_type` condition of `from` onto `to`, if `from` has one
fn carry_condition(from: &GitRepoStatus, to: &mut GitRepoStatus, condition_type: &str) {
    let Some(condition) = from.conditions.iter().find(|c| c.r#type == condition_type) else {
        return;
    };
    match to.conditions.iter_mut().find(|c| c.r#type == condition_type) {
        Some(existing) => *existing = condition.clone(),
        None => to.conditions.push(condition.clone()),
    }
}
