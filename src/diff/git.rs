//! Git-backed diff source.
//!
//! Runs `git` as a subprocess in the tracked working tree. Paths are read
//! with `-z` so names containing newlines or quotes survive intact.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::changeset::{ChangeSet, Revision, RevisionRange};

/// Source of changed paths between two revisions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Resolves a commit-ish to a full commit id.
    async fn resolve_revision(&self, revision: &str) -> Result<String>;

    /// Lists paths that differ between the two revisions of the range.
    ///
    /// An [`Revision::Initial`] previous revision lists every tracked path of
    /// the current revision and flags the set as a first deployment.
    async fn changed_paths(&self, range: &RevisionRange) -> Result<ChangeSet>;
}

/// Diff source driven by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitDiffReader {
    repository: PathBuf,
}

impl GitDiffReader {
    /// Creates a reader for the working tree at `repository`.
    #[must_use]
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
        }
    }

    /// Gets the repository path.
    #[must_use]
    pub fn repository(&self) -> &Path {
        &self.repository
    }

    /// Runs git and returns raw stdout, or stderr as the error message.
    async fn git(&self, args: &[String]) -> std::result::Result<Vec<u8>, String> {
        debug!("Running: git {}", args.join(" "));

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repository)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run git: {e}"))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    /// Fails unless the configured path is a git working tree.
    async fn ensure_repository(&self) -> Result<()> {
        self.git(&[String::from("rev-parse"), String::from("--git-dir")])
            .await
            .map(|_| ())
            .map_err(|message| {
                ConfigError::RepositoryUnavailable {
                    path: self.repository.clone(),
                    message,
                }
                .into()
            })
    }

    /// Resolves a revision that must exist.
    async fn verify(&self, revision: &str) -> Result<String> {
        let stdout = self.git(&verify_args(revision)).await.map_err(|message| {
            ConfigError::RevisionUnavailable {
                revision: revision.to_string(),
                message,
            }
        })?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

#[async_trait]
impl DiffSource for GitDiffReader {
    async fn resolve_revision(&self, revision: &str) -> Result<String> {
        self.ensure_repository().await?;
        self.verify(revision).await
    }

    async fn changed_paths(&self, range: &RevisionRange) -> Result<ChangeSet> {
        self.ensure_repository().await?;
        self.verify(&range.current).await?;

        if let Revision::Commit(previous) = &range.previous {
            // An unknown previous revision must never widen into a full deploy.
            self.verify(previous).await?;
        }

        let args = listing_args(&range.previous, &range.current);
        let stdout = self.git(&args).await.map_err(|message| {
            ConfigError::RevisionUnavailable {
                revision: range.to_string(),
                message,
            }
        })?;
        let paths = split_nul(&stdout);

        if range.previous.is_initial() {
            info!(
                "No previous revision: treating {} tracked paths at {} as changed",
                paths.len(),
                range.current
            );
            Ok(ChangeSet::first_deploy(paths))
        } else {
            info!("{} paths changed in {range}", paths.len());
            Ok(ChangeSet::new(paths))
        }
    }
}

/// Arguments that resolve a revision to a commit id.
fn verify_args(revision: &str) -> Vec<String> {
    vec![
        String::from("rev-parse"),
        String::from("--verify"),
        format!("{revision}^{{commit}}"),
    ]
}

/// Arguments that list the paths of a range.
fn listing_args(previous: &Revision, current: &str) -> Vec<String> {
    match previous {
        Revision::Initial => vec![
            String::from("ls-tree"),
            String::from("-r"),
            String::from("-z"),
            String::from("--name-only"),
            current.to_string(),
        ],
        Revision::Commit(previous) => vec![
            String::from("diff"),
            String::from("--name-only"),
            String::from("-z"),
            previous.clone(),
            current.to_string(),
        ],
    }
}

/// Splits NUL-terminated git output into paths.
fn split_nul(stdout: &[u8]) -> Vec<String> {
    stdout
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
