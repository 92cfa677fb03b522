//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace where the controller is deployed
    pub controller_namespace: String,
    /// Deployment whose tolerations are copied onto every apply job
    pub controller_deployment_name: String,
    /// Shard handled by this replica; `None` handles repos without a shard label
    pub shard_id: Option<String>,
    /// HTTP port for metrics and health checks
    pub metrics_port: u16,
    /// Image used for the clone and apply containers
    pub gitjob_image: String,
    /// Conflict retries passed to the apply command
    pub apply_conflict_retries: u32,
    /// Polling interval for repos that do not set one (seconds)
    pub default_polling_interval_secs: u64,
    /// Upper bound of the polling jitter, as a percentage of the interval
    pub polling_jitter_percent: u32,
    /// Attempts of the optimistic status update before giving up
    pub status_update_max_attempts: u32,
    /// Requeue after a job deletion or a new polling registration (seconds)
    pub requeue_after_secs: u64,
    /// Timeout for one remote commit lookup (seconds)
    pub git_fetch_timeout_secs: u64,
    /// Exponential backoff starting value for watch errors (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value for watch errors (milliseconds)
    pub backoff_max_ms: u64,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Proxy settings forwarded to apply jobs
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: "gitops-system".to_string(),
            controller_deployment_name: "gitops-controller".to_string(),
            shard_id: None,
            metrics_port: DEFAULT_METRICS_PORT,
            gitjob_image: DEFAULT_GITJOB_IMAGE.to_string(),
            apply_conflict_retries: DEFAULT_APPLY_CONFLICT_RETRIES,
            default_polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            polling_jitter_percent: DEFAULT_POLLING_JITTER_PERCENT,
            status_update_max_attempts: DEFAULT_STATUS_UPDATE_MAX_ATTEMPTS,
            requeue_after_secs: DEFAULT_REQUEUE_AFTER_SECS,
            git_fetch_timeout_secs: DEFAULT_GIT_FETCH_TIMEOUT_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            controller_namespace: env_var_or_default_str("POD_NAMESPACE", "gitops-system"),
            controller_deployment_name: env_var_or_default_str(
                "CONTROLLER_DEPLOYMENT_NAME",
                "gitops-controller",
            ),
            shard_id: env_var_opt("SHARD_ID"),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            gitjob_image: env_var_or_default_str("GITJOB_IMAGE", DEFAULT_GITJOB_IMAGE),
            apply_conflict_retries: env_var_or_default(
                "APPLY_CONFLICT_RETRIES",
                DEFAULT_APPLY_CONFLICT_RETRIES,
            ),
            default_polling_interval_secs: env_var_or_default(
                "DEFAULT_POLLING_INTERVAL_SECS",
                DEFAULT_POLLING_INTERVAL_SECS,
            ),
            polling_jitter_percent: env_var_or_default(
                "POLLING_JITTER_PERCENT",
                DEFAULT_POLLING_JITTER_PERCENT,
            ),
            status_update_max_attempts: env_var_or_default(
                "STATUS_UPDATE_MAX_ATTEMPTS",
                DEFAULT_STATUS_UPDATE_MAX_ATTEMPTS,
            ),
            requeue_after_secs: env_var_or_default("REQUEUE_AFTER_SECS", DEFAULT_REQUEUE_AFTER_SECS),
            git_fetch_timeout_secs: env_var_or_default(
                "GIT_FETCH_TIMEOUT_SECS",
                DEFAULT_GIT_FETCH_TIMEOUT_SECS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            http_proxy: env_var_opt("HTTP_PROXY"),
            https_proxy: env_var_opt("HTTPS_PROXY"),
            no_proxy: env_var_opt("NO_PROXY"),
        }
    }

    /// Get default polling interval duration
    pub fn default_polling_interval(&self) -> Duration {
        Duration::from_secs(self.default_polling_interval_secs)
    }

    /// Get requeue duration used after job deletion or polling registration
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    /// Get git fetch timeout duration
    pub fn git_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.git_fetch_timeout_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read environment variable, treating unset and empty the same
fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
