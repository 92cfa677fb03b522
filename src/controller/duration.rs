//! # Duration Parsing
//!
//! Parses the duration strings users write in GitRepo specs.

use crate::crd::GitRepo;
use crate::observability::metrics;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

static DURATION_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h|d))+$").ok());

static SEGMENT_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?P<number>\d+(?:\.\d+)?)(?P<unit>ns|us|µs|ms|s|m|h|d)").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration format '{0}', expected <number><unit> segments (e.g. '30s', '5m', '1h30m')")]
    Format(String),
    #[error("duration must be greater than 0, got '{0}'")]
    Zero(String),
}

fn unit_seconds(unit: &str) -> Option<f64> {
    match unit {
        "ns" => Some(1e-9),
        "us" | "µs" => Some(1e-6),
        "ms" => Some(1e-3),
        "s" => Some(1.0),
        "m" => Some(60.0),
        "h" => Some(3600.0),
        "d" => Some(86_400.0),
        _ => None,
    }
}

/// Parse a duration made of `<number><unit>` segments
///
/// Accepts the single-unit forms ("500ms", "30s", "5m", "1h", "1d") as well
/// as the compound form Kubernetes serializes durations in ("1m0s",
/// "1h30m", "1.5h"). Segments are summed.
pub fn parse_kubernetes_duration(value: &str) -> Result<Duration, DurationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    let format_error = || DurationError::Format(trimmed.to_string());

    let lower = trimmed.to_lowercase();
    let (Some(whole), Some(segment)) = (DURATION_REGEX.as_ref(), SEGMENT_REGEX.as_ref()) else {
        return Err(format_error());
    };
    if !whole.is_match(&lower) {
        return Err(format_error());
    }

    let mut seconds = 0.0_f64;
    for captures in segment.captures_iter(&lower) {
        let number: f64 = captures["number"].parse().map_err(|_| format_error())?;
        let unit = unit_seconds(&captures["unit"]).ok_or_else(format_error)?;
        seconds += number * unit;
    }
    if seconds <= 0.0 {
        return Err(DurationError::Zero(trimmed.to_string()));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| format_error())
}

/// Effective polling interval of a repo, falling back to `default` when unset or invalid
pub fn polling_interval(repo: &GitRepo, default: Duration) -> Duration {
    if repo.spec.polling_interval.is_empty() {
        return default;
    }
    match parse_kubernetes_duration(&repo.spec.polling_interval) {
        Ok(interval) => interval,
        Err(e) => {
            metrics::increment_duration_parsing_errors();
            warn!(
                resource.name = repo.name(),
                resource.namespace = repo.namespace_or_default(),
                "Ignoring pollingInterval: {}",
                e
            );
            default
        }
    }
}
