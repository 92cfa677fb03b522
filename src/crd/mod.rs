//! # Custom Resource Definitions
//!
//! - `GitRepo`: the Git source to poll and deploy
//! - `GitRepoRestriction`: allow-lists and defaults per namespace
//! - `BundleDeployment`: per-cluster deployment records rolled up into GitRepo status

mod bundle_deployment;
mod conditions;
mod gitrepo;
mod restriction;
mod status;

pub use bundle_deployment::{BundleDeployment, BundleDeploymentSpec, BundleDeploymentStatus};
pub use conditions::{
    set_active, set_error, set_transitioning, Condition, HasConditions, STATUS_FALSE, STATUS_TRUE,
};
pub use gitrepo::{GitRepo, GitRepoSpec};
pub use restriction::{GitRepoRestriction, GitRepoRestrictionSpec};
pub use status::{
    BundleState, BundleSummary, GitRepoDisplay, GitRepoStatus, ModifiedStatus, NonReadyResource,
    NonReadyStatus,
};
