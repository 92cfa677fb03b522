//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of every custom resource served by this controller
pub const API_GROUP: &str = "gitops.octopilot.io";

/// Field manager used for status and finalizer patches
pub const FIELD_MANAGER: &str = "gitops-controller";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Polling interval used when a GitRepo does not set one (seconds)
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 15;

/// Upper bound of the random delay added to each polling interval, as a percentage
pub const DEFAULT_POLLING_JITTER_PERCENT: u32 = 10;

/// Read-mutate-write attempts before a status update gives up on conflicts
pub const DEFAULT_STATUS_UPDATE_MAX_ATTEMPTS: u32 = 5;

/// Requeue used after a job deletion or a fresh polling registration (seconds)
pub const DEFAULT_REQUEUE_AFTER_SECS: u64 = 5;

/// Conflict retries handed to the apply command inside the job
pub const DEFAULT_APPLY_CONFLICT_RETRIES: u32 = 1;

/// Timeout for a single `git ls-remote` call (seconds)
pub const DEFAULT_GIT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Image running both the clone and apply containers of an apply job
pub const DEFAULT_GITJOB_IMAGE: &str = "ghcr.io/octopilot/gitjob:latest";

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// First and largest delay of the per-repo reconcile error backoff (seconds)
pub const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 5;
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Branch cloned when neither branch nor revision is set
pub const DEFAULT_BRANCH: &str = "master";

/// Finalizer that keeps a GitRepo around until its polling task is removed
pub const GITREPO_FINALIZER: &str = "gitops.octopilot.io/gitrepo-finalizer";

/// Label carrying the shard a GitRepo (and its jobs) belongs to
pub const SHARD_LABEL: &str = "gitops.octopilot.io/shard-ref";

/// Labels correlating a BundleDeployment back to its GitRepo
pub const REPO_LABEL: &str = "gitops.octopilot.io/repo-name";
pub const BUNDLE_NAMESPACE_LABEL: &str = "gitops.octopilot.io/bundle-namespace";
pub const BUNDLE_NAME_LABEL: &str = "gitops.octopilot.io/bundle-name";

/// Labels identifying the downstream cluster of a BundleDeployment
pub const CLUSTER_LABEL: &str = "gitops.octopilot.io/cluster";
pub const CLUSTER_NAMESPACE_LABEL: &str = "gitops.octopilot.io/cluster-namespace";

/// Job labels recording what the job was built for
pub const FORCE_SYNC_GENERATION_LABEL: &str = "gitops.octopilot.io/force-sync-generation";
pub const GENERATION_LABEL: &str = "gitops.octopilot.io/gitrepo-generation";

/// Job annotations recording what the job was built for
pub const GENERATION_ANNOTATION: &str = "generation";
pub const COMMIT_ANNOTATION: &str = "commit";

/// Condition types
pub const ACCEPTED_CONDITION: &str = "Accepted";
pub const GIT_POLLING_CONDITION: &str = "GitPolling";
pub const READY_CONDITION: &str = "Ready";
pub const RECONCILING_CONDITION: &str = "Reconciling";
pub const STALLED_CONDITION: &str = "Stalled";

/// Maximum number of non-ready resources kept in a summary
pub const MAX_NON_READY_RESOURCES: usize = 10;

/// Key of the CA bundle inside the `<name>-cabundle` secret
pub const CA_BUNDLE_FILE: &str = "additional-ca.crt";
