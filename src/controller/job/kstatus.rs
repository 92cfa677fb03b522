//! # Job Status
//!
//! Classifies an apply job the way kstatus does (InProgress, Current, Failed
//! or Terminating) and folds the result into the GitRepo status.

use crate::constants::{COMMIT_ANNOTATION, RECONCILING_CONDITION, STALLED_CONDITION};
use crate::crd::{set_active, set_error, set_transitioning, GitRepoStatus, HasConditions, STATUS_TRUE};
use crate::store::{ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Name of the init container cloning the repository
pub(crate) const CLONE_CONTAINER: &str = "gitcloner-initializer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    InProgress,
    Current,
    Failed,
    Terminating,
}

impl JobPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::InProgress => "InProgress",
            JobPhase::Current => "Current",
            JobPhase::Failed => "Failed",
            JobPhase::Terminating => "Terminating",
        }
    }
}

/// A condition reported alongside a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCondition {
    pub r#type: &'static str,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub message: String,
    pub conditions: Vec<PhaseCondition>,
}

impl JobStatus {
    fn in_progress(reason: &'static str, message: String) -> Self {
        Self {
            phase: JobPhase::InProgress,
            conditions: vec![PhaseCondition {
                r#type: RECONCILING_CONDITION,
                reason,
                message: message.clone(),
            }],
            message,
        }
    }
}

fn job_condition_true(job: &Job, condition_type: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == STATUS_TRUE)
        })
}

/// Classify `job`
#[must_use]
pub fn compute(job: &Job) -> JobStatus {
    if job.metadata.deletion_timestamp.is_some() {
        return JobStatus {
            phase: JobPhase::Terminating,
            message: "Resource scheduled for deletion".to_string(),
            conditions: Vec::new(),
        };
    }

    let spec = job.spec.as_ref();
    let parallelism = spec.and_then(|s| s.parallelism).unwrap_or(1);
    let completions = spec.and_then(|s| s.completions).unwrap_or(parallelism);
    let status = job.status.clone().unwrap_or_default();
    let succeeded = status.succeeded.unwrap_or_default();
    let active = status.active.unwrap_or_default();
    let failed = status.failed.unwrap_or_default();

    if job_condition_true(job, "Complete") {
        return JobStatus {
            phase: JobPhase::Current,
            message: format!("Job Completed. succeeded: {succeeded}/{completions}"),
            conditions: Vec::new(),
        };
    }
    if job_condition_true(job, "Failed") {
        let message = format!("Job Failed. failed: {failed}/{completions}");
        return JobStatus {
            phase: JobPhase::Failed,
            conditions: vec![PhaseCondition {
                r#type: STALLED_CONDITION,
                reason: "JobFailed",
                message: message.clone(),
            }],
            message,
        };
    }
    if status.start_time.is_none() {
        return JobStatus::in_progress("JobNotStarted", "Job not started".to_string());
    }
    JobStatus::in_progress(
        "JobInProgress",
        format!("Job in progress. success:{succeeded}, active: {active}, failed: {failed}"),
    )
}

/// Error lines reported by the apply command as JSON log entries
///
/// Falls back to the trimmed raw output when no line carries an error message.
#[must_use]
pub fn filter_job_output(output: &str) -> String {
    let errors: Vec<String> = output
        .lines()
        .filter_map(|line| {
            let start = line.find('{')?;
            let entry: serde_json::Value = serde_json::from_str(&line[start..]).ok()?;
            entry
                .get("errorMessage")
                .and_then(serde_json::Value::as_str)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
        })
        .collect();
    if errors.is_empty() {
        output.trim().to_string()
    } else {
        errors.join("\n")
    }
}

fn termination_messages(pod: &Pod) -> String {
    let Some(status) = pod.status.as_ref() else {
        return String::new();
    };
    let terminated = |c: &ContainerStatus| c.state.as_ref().and_then(|s| s.terminated.clone());

    let mut output = String::new();
    for container in status.container_statuses.iter().flatten() {
        if container.name == CLONE_CONTAINER {
            continue;
        }
        if let Some(message) = terminated(container).and_then(|t| t.message) {
            output.push_str(&message);
        }
    }
    // init containers only count when they failed
    for container in status.init_container_statuses.iter().flatten() {
        if let Some(t) = terminated(container).filter(|t| t.exit_code != 0) {
            output.push_str(t.message.as_deref().unwrap_or_default());
        }
    }
    output
}

/// Record the apply job's state in `status`
///
/// A failed job reports the termination messages of its most recent pod. A
/// completed job records the commit it was built for as `lastExecutedCommit`.
pub async fn set_status_from_gitjob(
    store: &dyn ObjectStore,
    namespace: &str,
    status: &mut GitRepoStatus,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = compute(job);

    let mut message = result.message.clone();
    if result.phase == JobPhase::Failed {
        let job_name = job.metadata.name.as_deref().unwrap_or_default();
        let mut pods = store.list_job_pods(namespace, job_name).await?;
        pods.sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
        if let Some(latest) = pods.last() {
            let output = filter_job_output(&termination_messages(latest));
            if !output.is_empty() {
                message = format!("{message}: {output}");
            }
        }
    }

    status.git_job_status = result.phase.as_str().to_string();
    for condition in &result.conditions {
        status.set_condition_status(condition.r#type, STATUS_TRUE, now);
        status.set_condition_message_if_blank(condition.r#type, &condition.message);
        status.set_condition_reason(condition.r#type, condition.reason);
    }

    match result.phase {
        JobPhase::Failed => set_error(status, &message, now),
        JobPhase::Current => {
            if result.message.contains("Job Completed") {
                if let Some(commit) = job
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(COMMIT_ANNOTATION))
                {
                    status.last_executed_commit.clone_from(commit);
                }
            }
            set_active(status, now);
        }
        JobPhase::InProgress => set_transitioning(status, "", now),
        // a terminating job is not an error
        JobPhase::Terminating => set_active(status, now),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus as K8sJobStatus};

    fn job_with(conditions: Vec<(&str, &str)>, succeeded: i32, failed: i32) -> Job {
        Job {
            spec: Some(JobSpec::default()),
            status: Some(K8sJobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(t, s)| JobCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..JobCondition::default()
                        })
                        .collect(),
                ),
                ..K8sJobStatus::default()
            }),
            ..Job::default()
        }
    }

    #[test]
    fn test_empty_job_has_not_started() {
        let status = compute(&Job::default());
        assert_eq!(status.phase, JobPhase::InProgress);
        assert_eq!(status.message, "Job not started");
        assert_eq!(status.conditions[0].r#type, RECONCILING_CONDITION);
    }

    #[test]
    fn test_completed_job_is_current() {
        let status = compute(&job_with(vec![("Complete", "True")], 1, 0));
        assert_eq!(status.phase, JobPhase::Current);
        assert_eq!(status.message, "Job Completed. succeeded: 1/1");
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn test_failed_job_reports_failure_count() {
        let status = compute(&job_with(vec![("Failed", "True")], 0, 1));
        assert_eq!(status.phase, JobPhase::Failed);
        assert_eq!(status.message, "Job Failed. failed: 1/1");
        assert_eq!(status.conditions[0].r#type, STALLED_CONDITION);
    }

    #[test]
    fn test_false_conditions_are_ignored() {
        let status = compute(&job_with(vec![("Failed", "False")], 0, 0));
        assert_eq!(status.phase, JobPhase::InProgress);
    }

    #[test]
    fn test_filter_job_output() {
        let output = "noise\n{\"level\":\"fatal\",\"errorMessage\":\"bundle invalid\"}\n";
        assert_eq!(filter_job_output(output), "bundle invalid");
        assert_eq!(filter_job_output("  plain failure \n"), "plain failure");
        assert_eq!(filter_job_output(""), "");
    }
}
