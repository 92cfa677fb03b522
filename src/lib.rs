//! GitOps Controller Library
//!
//! Polls Git repositories, runs one apply job per resolved commit and rolls
//! the resulting bundle deployments up into the `GitRepo` status.
//!
//! Tests are included in the module files and under `tests/`.

pub mod clock;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod git;
pub mod observability;
pub mod runtime;
pub mod server;
pub mod store;
