//! Version-control adapter.
//!
//! The engine only needs three operations from version control: a clean/dirty
//! status before applying, checkpoint commits around a run, and reverting a
//! checkpoint. [`GitCli`] shells out to `git`; a missing binary or a vault
//! that is not a repository reads as [`VcsStatus::NotARepo`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use vaultward_core::{Result, VaultwardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsStatus {
    NotARepo,
    Clean,
    Dirty,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn status(&self) -> Result<VcsStatus>;

    /// Commit everything outstanding. `Ok(None)` when there was nothing to
    /// commit or the vault is not a repository.
    async fn checkpoint(&self, message: &str) -> Result<Option<String>>;

    async fn revert(&self, commit_id: &str) -> Result<()>;
}

/// For vaults without version control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVcs;

#[async_trait]
impl VersionControl for NoVcs {
    async fn status(&self) -> Result<VcsStatus> {
        Ok(VcsStatus::NotARepo)
    }

    async fn checkpoint(&self, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn revert(&self, commit_id: &str) -> Result<()> {
        Err(VaultwardError::Vcs(format!(
            "cannot revert {commit_id}: vault is not under version control"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    /// Vault-relative paths the engine owns (state dir, offline marker);
    /// never counted as dirt and never committed.
    excluded: Vec<String>,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    pub fn excluding(mut self, rel: impl Into<String>) -> Self {
        self.excluded.push(rel.into());
        self
    }

    fn pathspec(&self) -> Vec<String> {
        let mut spec = vec!["--".to_string(), ".".to_string()];
        spec.extend(self.excluded.iter().map(|rel| format!(":(exclude){rel}")));
        spec
    }

    fn is_repo(&self) -> bool {
        self.root.join(".git").exists()
    }

    async fn git(&self, args: &[String]) -> Result<Option<std::process::Output>> {
        let out = tokio::process::Command::new("git")
            .args(args)
            .env("GIT_AUTHOR_NAME", "Vaultward")
            .env("GIT_AUTHOR_EMAIL", "vaultward@localhost")
            .env("GIT_COMMITTER_NAME", "Vaultward")
            .env("GIT_COMMITTER_EMAIL", "vaultward@localhost")
            .current_dir(&self.root)
            .output()
            .await;
        match out {
            Ok(out) => Ok(Some(out)),
            // git not installed
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn git_ok(&self, args: &[String]) -> Result<String> {
        let Some(out) = self.git(args).await? else {
            return Err(VaultwardError::Vcs("git is not installed".to_string()));
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(VaultwardError::Vcs(format!("git {} failed: {stderr}", args.join(" "))));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl VersionControl for GitCli {
    async fn status(&self) -> Result<VcsStatus> {
        if !self.is_repo() {
            return Ok(VcsStatus::NotARepo);
        }
        let mut args = owned(&["status", "--porcelain"]);
        args.extend(self.pathspec());
        let Some(out) = self.git(&args).await? else {
            return Ok(VcsStatus::NotARepo);
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!(%stderr, "git status failed");
            return Err(VaultwardError::Vcs(format!("git status failed: {}", stderr.trim())));
        }
        Ok(if out.stdout.iter().all(u8::is_ascii_whitespace) {
            VcsStatus::Clean
        } else {
            VcsStatus::Dirty
        })
    }

    async fn checkpoint(&self, message: &str) -> Result<Option<String>> {
        if !self.is_repo() {
            return Ok(None);
        }
        let mut add = owned(&["add", "-A"]);
        add.extend(self.pathspec());
        self.git_ok(&add).await?;

        // `git diff --cached --quiet` exits 0 when nothing is staged.
        let staged = self.git(&owned(&["diff", "--cached", "--quiet"])).await?;
        if staged.is_some_and(|out| out.status.success()) {
            return Ok(None);
        }

        self.git_ok(&owned(&["commit", "-m", message, "--no-verify"])).await?;
        let commit = self.git_ok(&owned(&["rev-parse", "HEAD"])).await?;
        info!(commit = %commit, message, "vault checkpoint committed");
        Ok(Some(commit))
    }

    async fn revert(&self, commit_id: &str) -> Result<()> {
        if !self.is_repo() {
            return Err(VaultwardError::Vcs("vault is not a git repository".to_string()));
        }
        self.git_ok(&owned(&["revert", "--no-edit", commit_id])).await?;
        info!(commit = commit_id, "vault checkpoint reverted");
        Ok(())
    }
}

/// Path of `state_dir` relative to the vault when it lives inside it.
pub fn vault_relative(vault: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(vault)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
        .filter(|rel| !rel.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn plain_directory_is_not_a_repo() {
        let dir = TempDir::new().unwrap();
        let git = GitCli::new(dir.path());
        assert_eq!(git.status().await.unwrap(), VcsStatus::NotARepo);
        assert_eq!(git.checkpoint("x").await.unwrap(), None);
        assert!(git.revert("abc").await.is_err());
    }

    #[test]
    fn pathspec_excludes_engine_paths() {
        let git = GitCli::new("/vault").excluding(".vaultward").excluding(".nosync");
        assert_eq!(
            git.pathspec(),
            vec!["--", ".", ":(exclude).vaultward", ":(exclude).nosync"]
        );
    }

    #[test]
    fn state_dir_outside_vault_has_no_relative_path() {
        assert_eq!(
            vault_relative(Path::new("/vault"), Path::new("/vault/.vaultward")),
            Some(".vaultward".to_string())
        );
        assert_eq!(vault_relative(Path::new("/vault"), Path::new("/state")), None);
    }

    #[tokio::test]
    async fn no_vcs_never_checkpoints() {
        assert_eq!(NoVcs.status().await.unwrap(), VcsStatus::NotARepo);
        assert_eq!(NoVcs.checkpoint("m").await.unwrap(), None);
    }
}
