//! # Names
//!
//! Deterministic names of the objects derived from a GitRepo, and the commit
//! selection that feeds the apply job's identity.

use crate::crd::{GitRepo, GitRepoStatus};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Longest name accepted for the derived objects (DNS label length)
const MAX_NAME_LENGTH: usize = 63;

/// First `n` hex characters of the md5 digest of `value`
#[must_use]
pub fn hex(value: &str, n: usize) -> String {
    let digest = format!("{:x}", md5::compute(value.as_bytes()));
    digest.chars().take(n).collect()
}

fn sha256_hex(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Join `parts` with "-", shortening to a valid object name when too long
///
/// Overlong names keep a 57 character prefix plus a digest suffix. When the
/// cut lands on a character that cannot end a name the prefix loses one more
/// character and the suffix gains one.
#[must_use]
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let digest = sha256_hex(&full);
    let bytes = full.as_bytes();
    let last = bytes[56];
    if last.is_ascii_lowercase() || last.is_ascii_digit() {
        format!("{}-{}", &full[..57], &digest[..5])
    } else {
        format!("{}-{}", &full[..56], &digest[..6])
    }
}

/// Name of the apply job for `commit`
#[must_use]
pub fn job_name_for_commit(repo: &GitRepo, commit: &str) -> String {
    let suffix = hex(&format!("{}{}", repo.spec.repo, commit), 5);
    safe_concat_name(&[repo.name(), &suffix])
}

/// Name of the apply job for the repo's current `status.commit`
#[must_use]
pub fn job_name(repo: &GitRepo) -> String {
    let commit = repo
        .status
        .as_ref()
        .map(|s| s.commit.as_str())
        .unwrap_or_default();
    job_name_for_commit(repo, commit)
}

/// Name shared by the job's service account, role and role binding
#[must_use]
pub fn service_account_name(repo: &GitRepo) -> String {
    safe_concat_name(&["git", repo.name()])
}

#[must_use]
pub fn ca_bundle_name(repo: &GitRepo) -> String {
    safe_concat_name(&[repo.name(), "cabundle"])
}

/// Commit the next apply job should be built for
///
/// A polling commit replaces the current one, and a webhook commit replaces
/// both since webhooks report pushes immediately.
#[must_use]
pub fn next_commit(status: &GitRepoStatus) -> String {
    let mut commit = status.commit.as_str();
    if !status.polling_commit.is_empty() && status.polling_commit != commit {
        commit = &status.polling_commit;
    }
    if !status.webhook_commit.is_empty() && status.webhook_commit != commit {
        commit = &status.webhook_commit;
    }
    commit.to_string()
}
