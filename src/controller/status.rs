//! # Status Rollup
//!
//! Rolls the bundle deployments labelled for a GitRepo up into its summary,
//! display block, cluster counts and `Ready` condition, and maintains the
//! `Accepted` condition.

use crate::constants::{ACCEPTED_CONDITION, MAX_NON_READY_RESOURCES, READY_CONDITION};
use crate::controller::job::JobPhase;
use crate::crd::{
    BundleDeployment, BundleState, BundleSummary, GitRepo, GitRepoStatus, HasConditions, ModifiedStatus,
    NonReadyResource, NonReadyStatus, STATUS_FALSE, STATUS_TRUE,
};
use crate::store::{ObjectStore, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Modified and non-ready entries listed per resource in the ready message
const MAX_STATUS_DETAILS: usize = 4;

/// Kind named in the ready message
const REFERENCED_KIND: &str = "Bundle";

/// Display state while the apply job has not settled
pub const GIT_UPDATING_STATE: &str = "GitUpdating";

/// State of one bundle deployment
#[must_use]
pub fn get_deployment_state(deployment: &BundleDeployment) -> BundleState {
    let status = deployment.status.clone().unwrap_or_default();
    let spec = &deployment.spec;

    if status.applied_deployment_id != spec.deployment_id {
        if status.is_condition_false("Deployed") {
            return BundleState::ErrApplied;
        }
        return BundleState::WaitApplied;
    }
    if !status.ready {
        return BundleState::NotReady;
    }
    if spec.deployment_id != spec.staged_deployment_id {
        return BundleState::OutOfSync;
    }
    if !status.non_modified {
        return BundleState::Modified;
    }
    BundleState::Ready
}

/// Message of the first of the `Deployed`, `Installed`, `Monitored` conditions that has one
#[must_use]
pub fn message_from_deployment(deployment: &BundleDeployment) -> String {
    let Some(status) = deployment.status.as_ref() else {
        return String::new();
    };
    ["Deployed", "Installed", "Monitored"]
        .into_iter()
        .map(|t| status.condition_message(t))
        .find(|m| !m.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Count one deployment in `summary`, listing it when not ready
pub fn increment_state(
    summary: &mut BundleSummary,
    name: &str,
    state: BundleState,
    message: String,
    modified: &[ModifiedStatus],
    non_ready: &[NonReadyStatus],
) {
    let counter = match state {
        BundleState::Modified => &mut summary.modified,
        BundleState::Pending => &mut summary.pending,
        BundleState::WaitApplied => &mut summary.wait_applied,
        BundleState::ErrApplied => &mut summary.err_applied,
        BundleState::NotReady => &mut summary.not_ready,
        BundleState::OutOfSync => &mut summary.out_of_sync,
        BundleState::Ready => &mut summary.ready,
    };
    *counter += 1;

    if !name.is_empty() && state != BundleState::Ready && summary.non_ready_resources.len() < MAX_NON_READY_RESOURCES {
        summary.non_ready_resources.push(NonReadyResource {
            name: name.to_string(),
            state,
            message,
            modified_status: modified.to_vec(),
            non_ready_status: non_ready.to_vec(),
        });
    }
}

/// Why `summary` is not ready; empty when it is
///
/// Each non-ready state with a count contributes its first listed resource
/// and up to four of that resource's modified and non-ready entries. The
/// parts are sorted and joined with "; ".
#[must_use]
pub fn ready_message(summary: &BundleSummary, referenced_kind: &str) -> String {
    let states = [
        BundleState::OutOfSync,
        BundleState::NotReady,
        BundleState::WaitApplied,
        BundleState::ErrApplied,
        BundleState::Pending,
        BundleState::Modified,
    ];

    let mut messages = Vec::new();
    for state in states {
        let count = summary.count(state);
        if count <= 0 {
            continue;
        }
        let Some(resource) = summary.non_ready_resources.iter().find(|r| r.state == state) else {
            continue;
        };
        if resource.message.is_empty() {
            messages.push(format!("{state}({count}) [{referenced_kind} {}]", resource.name));
        } else {
            messages.push(format!(
                "{state}({count}) [{referenced_kind} {}: {}]",
                resource.name, resource.message
            ));
        }
        messages.extend(
            resource
                .modified_status
                .iter()
                .take(MAX_STATUS_DETAILS)
                .map(ToString::to_string),
        );
        messages.extend(
            resource
                .non_ready_status
                .iter()
                .take(MAX_STATUS_DETAILS)
                .map(ToString::to_string),
        );
    }

    messages.sort();
    messages.join("; ")
}

/// `Ready` is True exactly when there is nothing to report
pub fn set_ready_conditions<T: HasConditions + ?Sized>(
    target: &mut T,
    referenced_kind: &str,
    summary: &BundleSummary,
    now: DateTime<Utc>,
) {
    let message = ready_message(summary, referenced_kind);
    let status = if message.is_empty() { STATUS_TRUE } else { STATUS_FALSE };
    target.set_condition_status(READY_CONDITION, status, now);
    target.set_condition_message(READY_CONDITION, &message);
}

/// Ready and desired cluster counts
///
/// Deployments are bucketed by target cluster. Desired is the number of
/// buckets and ready is the number of buckets whose deployments are all
/// ready, so ready never exceeds desired. Deployments without cluster labels
/// count towards neither.
#[must_use]
pub fn cluster_counts(deployments: &[BundleDeployment]) -> (i32, i32) {
    let mut clusters: BTreeMap<(String, String), bool> = BTreeMap::new();

    for deployment in deployments {
        let Some(cluster) = deployment.cluster_key() else {
            continue;
        };
        let ready = get_deployment_state(deployment) == BundleState::Ready;
        clusters
            .entry(cluster)
            .and_modify(|all_ready| *all_ready &= ready)
            .or_insert(ready);
    }

    let ready = clusters.values().filter(|all_ready| **all_ready).count();
    let to_i32 = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    (to_i32(ready), to_i32(clusters.len()))
}

/// Fold `deployments` into `status`
///
/// Deployments are visited in uid order so the output does not depend on
/// list order. An all-ready rollup carries no display message.
pub fn summarize_bundle_deployments(
    status: &mut GitRepoStatus,
    deployments: &mut [BundleDeployment],
    now: DateTime<Utc>,
) {
    deployments.sort_by(|a, b| a.metadata.uid.cmp(&b.metadata.uid));

    let mut summary = BundleSummary::default();
    let mut worst: Option<BundleState> = None;
    let mut message = String::new();

    for deployment in deployments.iter() {
        let state = get_deployment_state(deployment);
        let deployment_message = message_from_deployment(deployment);
        let deployment_status = deployment.status.clone().unwrap_or_default();
        increment_state(
            &mut summary,
            deployment.bundle_name(),
            state,
            deployment_message.clone(),
            &deployment_status.modified_status,
            &deployment_status.non_ready_status,
        );
        summary.desired_ready += 1;

        match worst {
            Some(w) if state.rank() <= w.rank() => {}
            _ => {
                worst = Some(state);
                message = deployment_message;
            }
        }
    }

    let state = match worst {
        None | Some(BundleState::Ready) => {
            message.clear();
            String::new()
        }
        Some(state) => state.as_str().to_string(),
    };

    let (ready_clusters, desired_ready_clusters) = cluster_counts(deployments);
    status.ready_clusters = ready_clusters;
    status.desired_ready_clusters = desired_ready_clusters;

    status.display.ready_bundle_deployments = format!("{}/{}", summary.ready, summary.desired_ready);
    status.display.state = state;
    status.display.error = !message.is_empty();
    status.display.message = message;

    set_ready_conditions(status, REFERENCED_KIND, &summary, now);
    status.summary = summary;
}

/// List the repo's bundle deployments and fold them into its status
///
/// The display state reads `GitUpdating` until the apply job is current.
pub async fn set_status_from_bundle_deployments(
    store: &dyn ObjectStore,
    repo: &mut GitRepo,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let mut deployments = store
        .list_bundle_deployments(repo.namespace_or_default(), repo.name())
        .await?;
    let status = repo.status_mut();
    summarize_bundle_deployments(status, &mut deployments, now);
    if status.git_job_status != JobPhase::Current.as_str() {
        status.display.state = GIT_UPDATING_STATE.to_string();
    }
    Ok(())
}

/// Set `Accepted` from `error`; its update time moves only when something changed
pub fn set_accepted(status: &mut GitRepoStatus, error: Option<&str>, now: DateTime<Utc>) {
    let before = status.condition(ACCEPTED_CONDITION).cloned();
    status.set_condition_error(ACCEPTED_CONDITION, "", error, now);
    if status.condition(ACCEPTED_CONDITION).cloned() != before {
        status.set_condition_last_updated(ACCEPTED_CONDITION, &now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
}
