//! # Runtime
//!
//! Process wiring around the reconciler.
//!
//! - `initialization`: tracing, metrics, HTTP server, client and collaborators
//! - `watch_loop`: the kube-runtime controller and its restart loop
//! - `error_policy`: per-resource backoff and watch error classification

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
