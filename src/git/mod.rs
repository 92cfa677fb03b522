//! # Git
//!
//! Resolving the latest commit of a remote repository.

mod cli;

pub use cli::{parse_ls_remote, GitCliFetcher};

use crate::crd::GitRepo;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("commit not found for revision: {0}")]
    RevisionNotFound(String),
    #[error("commit not found for branch: {0}")]
    BranchNotFound(String),
    #[error("failed to read credentials from secret {name}: {reason}")]
    Credentials { name: String, reason: String },
    #[error("git ls-remote timed out after {0}s")]
    Timeout(u64),
    #[error("git ls-remote failed: {0}")]
    Command(String),
}

/// Looks up the commit a GitRepo currently points at
///
/// Implementations must be safe to call concurrently for different repos
/// and must bound their own runtime.
#[async_trait]
pub trait GitFetcher: Send + Sync {
    async fn latest_commit(&self, repo: &GitRepo) -> Result<String, FetchError>;
}
