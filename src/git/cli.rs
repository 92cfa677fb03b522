//! [`GitFetcher`] running `git ls-remote`.
//!
//! Credentials come from the GitRepo's client secret: basic-auth secrets are
//! sent as an `Authorization` header, ssh-auth secrets are written to a
//! temporary key file for the duration of the call.

use super::{FetchError, GitFetcher};
use crate::constants::DEFAULT_BRANCH;
use crate::crd::GitRepo;
use crate::store::ObjectStore;
use async_trait::async_trait;
use base64::Engine;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";
const SSH_AUTH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";

pub struct GitCliFetcher {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl std::fmt::Debug for GitCliFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCliFetcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GitCliFetcher {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Adds credential flags to `command`; returned temp files must outlive the call
    async fn configure_credentials(
        &self,
        repo: &GitRepo,
        command: &mut Command,
    ) -> Result<Vec<NamedTempFile>, FetchError> {
        let mut files = Vec::new();

        if !repo.spec.ca_bundle.is_empty() {
            let pem = base64::engine::general_purpose::STANDARD
                .decode(repo.spec.ca_bundle.trim())
                .map_err(|e| FetchError::Credentials {
                    name: "caBundle".to_string(),
                    reason: e.to_string(),
                })?;
            let file = write_temp_file(&pem, "caBundle")?;
            command
                .arg("-c")
                .arg(format!("http.sslCAInfo={}", file.path().display()));
            files.push(file);
        }

        let secret_name = repo.spec.client_secret_name.as_str();
        if secret_name.is_empty() {
            return Ok(files);
        }

        let credentials_error = |reason: String| FetchError::Credentials {
            name: secret_name.to_string(),
            reason,
        };
        let secret = self
            .store
            .get_secret(repo.namespace_or_default(), secret_name)
            .await
            .map_err(|e| credentials_error(e.to_string()))?
            .ok_or_else(|| credentials_error("secret not found".to_string()))?;
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .ok_or_else(|| credentials_error(format!("missing key {key}")))
        };

        match secret.type_.as_deref() {
            Some(SSH_AUTH_SECRET_TYPE) => {
                let key = field("ssh-privatekey")?;
                let file = write_temp_file(key.as_bytes(), secret_name)?;
                command.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
                        file.path().display()
                    ),
                );
                files.push(file);
            }
            Some(BASIC_AUTH_SECRET_TYPE) | None => {
                let username = field("username")?;
                let password = field("password")?;
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                command
                    .arg("-c")
                    .arg(format!("http.extraHeader=Authorization: Basic {token}"));
            }
            Some(other) => {
                return Err(credentials_error(format!("unsupported secret type {other}")));
            }
        }
        Ok(files)
    }
}

fn write_temp_file(contents: &[u8], what: &str) -> Result<NamedTempFile, FetchError> {
    let io_error = |e: std::io::Error| FetchError::Credentials {
        name: what.to_string(),
        reason: e.to_string(),
    };
    let mut file = NamedTempFile::new().map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    Ok(file)
}

fn is_commit_sha(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Pick the commit for `branch`/`revision` out of `git ls-remote` output
///
/// A revision wins over a branch; tags resolve to the commit they point at.
pub fn parse_ls_remote(output: &str, branch: &str, revision: &str) -> Result<String, FetchError> {
    let refs: Vec<(&str, &str)> = output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(sha, reference)| (sha.trim(), reference.trim()))
        .collect();
    let lookup = |reference: &str| {
        refs.iter()
            .find(|(_, r)| *r == reference)
            .map(|(sha, _)| (*sha).to_string())
    };

    if !revision.is_empty() {
        if is_commit_sha(revision) {
            return Ok(revision.to_string());
        }
        return lookup(&format!("refs/tags/{revision}^{{}}"))
            .or_else(|| lookup(&format!("refs/tags/{revision}")))
            .or_else(|| lookup(&format!("refs/heads/{revision}")))
            .ok_or_else(|| FetchError::RevisionNotFound(revision.to_string()));
    }

    let branch = if branch.is_empty() { DEFAULT_BRANCH } else { branch };
    lookup(&format!("refs/heads/{branch}"))
        .ok_or_else(|| FetchError::BranchNotFound(branch.to_string()))
}

#[async_trait]
impl GitFetcher for GitCliFetcher {
    async fn latest_commit(&self, repo: &GitRepo) -> Result<String, FetchError> {
        if is_commit_sha(&repo.spec.revision) {
            return Ok(repo.spec.revision.clone());
        }

        let mut command = Command::new("git");
        command.env("GIT_TERMINAL_PROMPT", "0").kill_on_drop(true);
        if repo.spec.insecure_skip_tls_verify {
            command.arg("-c").arg("http.sslVerify=false");
        }
        let _credential_files = self.configure_credentials(repo, &mut command).await?;
        command.arg("ls-remote").arg(&repo.spec.repo);

        debug!(
            resource.name = repo.name(),
            repo = repo.spec.repo.as_str(),
            "Running git ls-remote"
        );
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_elapsed| FetchError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| FetchError::Command(e.to_string()))?;
        if !output.status.success() {
            return Err(FetchError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_ls_remote(
            &String::from_utf8_lossy(&output.stdout),
            &repo.spec.branch,
            &repo.spec.revision,
        )
    }
}
