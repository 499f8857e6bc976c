//! Version-control collaborator.
//!
//! The execution loop needs only a handful of VCS primitives. They sit behind
//! [`VcsOperations`] so tests can swap in [`crate::testing::MockVcs`]; the real
//! implementation shells out to `git`.
//!
//! Every mutating operation is path-limited: several tasks may share one working
//! tree, so nothing here stages, commits or reverts files it was not handed.

use crate::scope::{ChangeType, FileChange};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Narrow async interface over the project's version control.
#[async_trait]
pub trait VcsOperations: Send + Sync {
    /// Files with uncommitted changes (tracked or untracked).
    async fn changed_files(&self) -> Result<Vec<FileChange>>;

    /// Stage the given paths, including deletions.
    async fn add(&self, files: &[PathBuf]) -> Result<()>;

    /// Commit only the given paths. Returns the new commit id.
    async fn commit(&self, message: &str, files: &[PathBuf]) -> Result<String>;

    /// Restore tracked files from HEAD and delete untracked ones.
    async fn revert_files(&self, files: &[PathBuf]) -> Result<()>;

    /// Push a refspec to a remote.
    async fn push(&self, remote: &str, refspec: &str) -> Result<()>;

    /// Stage a file move.
    async fn stage_rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// `git` subprocess implementation.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_dir: PathBuf,
}

impl GitVcs {
    #[must_use]
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    #[must_use]
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> =
            args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", display_args(&args)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", display_args(&args), stderr.trim())
        }
    }

    /// Whether `path` exists in HEAD.
    async fn in_head(&self, path: &Path) -> bool {
        let spec = format!("HEAD:{}", path.to_string_lossy());
        self.git(["cat-file", "-e", spec.as_str()]).await.is_ok()
    }
}

#[async_trait]
impl VcsOperations for GitVcs {
    async fn changed_files(&self) -> Result<Vec<FileChange>> {
        let stdout = self
            .git(["status", "--porcelain=v1", "--untracked-files=all"])
            .await
            .context("Failed to list changed files")?;
        Ok(parse_porcelain(&stdout))
    }

    async fn add(&self, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut args: Vec<OsString> = vec!["add".into(), "-A".into(), "--".into()];
        args.extend(files.iter().map(|f| f.as_os_str().to_os_string()));
        self.git(args).await.context("Failed to stage files")?;
        Ok(())
    }

    async fn commit(&self, message: &str, files: &[PathBuf]) -> Result<String> {
        if files.is_empty() {
            bail!("Nothing to commit");
        }
        self.add(files).await?;

        let mut args: Vec<OsString> =
            vec!["commit".into(), "-m".into(), message.into(), "--".into()];
        args.extend(files.iter().map(|f| f.as_os_str().to_os_string()));
        self.git(args).await.context("Failed to commit")?;

        let hash = self.git(["rev-parse", "HEAD"]).await?;
        let hash = hash.trim().to_string();
        debug!(commit = %hash, files = files.len(), "Committed changes");
        Ok(hash)
    }

    async fn revert_files(&self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            if self.in_head(file).await {
                self.git([
                    OsStr::new("checkout"),
                    OsStr::new("HEAD"),
                    OsStr::new("--"),
                    file.as_os_str(),
                ])
                .await
                .with_context(|| format!("Failed to restore {}", file.display()))?;
            } else {
                self.git([
                    OsStr::new("rm"),
                    OsStr::new("--cached"),
                    OsStr::new("-q"),
                    OsStr::new("--ignore-unmatch"),
                    OsStr::new("--"),
                    file.as_os_str(),
                ])
                .await
                .with_context(|| format!("Failed to unstage {}", file.display()))?;
                let absolute = self.repo_dir.join(file);
                if absolute.is_file() {
                    std::fs::remove_file(&absolute)
                        .with_context(|| format!("Failed to delete {}", absolute.display()))?;
                }
            }
            debug!(file = %file.display(), "Reverted file");
        }
        Ok(())
    }

    async fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        self.git(["push", remote, refspec])
            .await
            .with_context(|| format!("Failed to push {refspec} to {remote}"))?;
        Ok(())
    }

    async fn stage_rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.git([
            OsStr::new("rm"),
            OsStr::new("--cached"),
            OsStr::new("-q"),
            OsStr::new("--ignore-unmatch"),
            OsStr::new("--"),
            from.as_os_str(),
        ])
        .await
        .context("Failed to unstage old task path")?;
        self.git([OsStr::new("add"), OsStr::new("--"), to.as_os_str()])
            .await
            .context("Failed to stage new task path")?;
        Ok(())
    }
}

fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `git status --porcelain=v1` output.
///
/// Renames report the new path. Quoted paths are unquoted.
#[must_use]
pub fn parse_porcelain(output: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let status = &line[..2];
        let mut path = &line[3..];
        if let Some((_, to)) = path.split_once(" -> ") {
            path = to;
        }
        let path = path.trim_matches('"');

        let change_type = if status.contains('D') {
            ChangeType::Deleted
        } else if status == "??" || status.contains('A') {
            ChangeType::Created
        } else {
            ChangeType::Modified
        };
        changes.push(FileChange {
            path: PathBuf::from(path),
            change_type,
        });
    }
    changes
}
