//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `gitops_reconciliations_total` - Total number of reconciliations
//! - `gitops_reconciliation_errors_total` - Total number of reconciliation errors
//! - `gitops_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `gitops_requeues_total` - Requeues by trigger source
//! - `gitops_jobs_created_total` - Apply jobs created
//! - `gitops_job_creation_errors_total` - Apply job creations that failed
//! - `gitops_job_deletions_total` - Apply jobs deleted, by reason
//! - `gitops_commit_fetches_total` - Remote commit lookups
//! - `gitops_commit_fetch_errors_total` - Remote commit lookups that failed
//! - `gitops_commit_fetch_duration_seconds` - Duration of remote commit lookups
//! - `gitops_polling_skipped_total` - Polls skipped because the previous one was still running
//! - `gitops_polling_tasks` - Polling tasks currently scheduled
//! - `gitops_status_update_conflicts_total` - Status writes rejected for a stale resourceVersion
//! - `gitops_duration_parsing_errors_total` - Unparsable `pollingInterval` values

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("gitops_reconciliations_total", "Total number of reconciliations")
        .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitops_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("gitops_requeues_total", "Total number of requeues by trigger source"),
        &["trigger_source"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static JOBS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("gitops_jobs_created_total", "Total number of apply jobs created")
        .expect("Failed to create JOBS_CREATED_TOTAL metric - this should never happen")
});

static JOB_CREATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_job_creation_errors_total",
        "Total number of failed apply job creations",
    )
    .expect("Failed to create JOB_CREATION_ERRORS_TOTAL metric - this should never happen")
});

static JOB_DELETIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("gitops_job_deletions_total", "Total number of apply jobs deleted by reason"),
        &["reason"],
    )
    .expect("Failed to create JOB_DELETIONS_TOTAL metric - this should never happen")
});

static COMMIT_FETCHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("gitops_commit_fetches_total", "Total number of remote commit lookups")
        .expect("Failed to create COMMIT_FETCHES_TOTAL metric - this should never happen")
});

static COMMIT_FETCH_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_commit_fetch_errors_total",
        "Total number of failed remote commit lookups",
    )
    .expect("Failed to create COMMIT_FETCH_ERRORS_TOTAL metric - this should never happen")
});

static COMMIT_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitops_commit_fetch_duration_seconds",
            "Duration of remote commit lookups in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create COMMIT_FETCH_DURATION metric - this should never happen")
});

static POLLING_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_polling_skipped_total",
        "Total number of polls skipped because the previous poll was still running",
    )
    .expect("Failed to create POLLING_SKIPPED_TOTAL metric - this should never happen")
});

static POLLING_TASKS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("gitops_polling_tasks", "Current number of scheduled polling tasks")
        .expect("Failed to create POLLING_TASKS metric - this should never happen")
});

static STATUS_UPDATE_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_status_update_conflicts_total",
        "Total number of status writes rejected because of a stale resourceVersion",
    )
    .expect("Failed to create STATUS_UPDATE_CONFLICTS_TOTAL metric - this should never happen")
});

static DURATION_PARSING_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_duration_parsing_errors_total",
        "Total number of pollingInterval parsing failures",
    )
    .expect("Failed to create DURATION_PARSING_ERRORS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOB_CREATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOB_DELETIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMIT_FETCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMIT_FETCH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMIT_FETCH_DURATION.clone()))?;
    REGISTRY.register(Box::new(POLLING_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLLING_TASKS.clone()))?;
    REGISTRY.register(Box::new(STATUS_UPDATE_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DURATION_PARSING_ERRORS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(trigger_source: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger_source]).inc();
}

pub fn increment_jobs_created() {
    JOBS_CREATED_TOTAL.inc();
}

pub fn increment_job_creation_errors() {
    JOB_CREATION_ERRORS_TOTAL.inc();
}

/// Count an apply job deletion; `reason` is one of succeeded, force-sync, generation, superseded
pub fn increment_job_deletions(reason: &str) {
    JOB_DELETIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_commit_fetch(success: bool, duration: f64) {
    COMMIT_FETCHES_TOTAL.inc();
    COMMIT_FETCH_DURATION.observe(duration);
    if !success {
        COMMIT_FETCH_ERRORS_TOTAL.inc();
    }
}

pub fn increment_polling_skipped() {
    POLLING_SKIPPED_TOTAL.inc();
}

pub fn set_polling_tasks(count: usize) {
    POLLING_TASKS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn increment_status_update_conflicts() {
    STATUS_UPDATE_CONFLICTS_TOTAL.inc();
}

pub fn increment_duration_parsing_errors() {
    DURATION_PARSING_ERRORS_TOTAL.inc();
}
