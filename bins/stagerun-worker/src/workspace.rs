// Workspace provisioning: one on-disk checkout per job

use crate::git;
use anyhow::{Context, Result};
use async_trait::async_trait;
use stagerun_common::types::{ENTRY_POINT, METADATA_DIR};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Check out `repo_url` at `commit_sha` and return the workspace path
    async fn provision(&self, repo_url: &str, branch: &str, commit_sha: &str) -> Result<PathBuf>;

    async fn release(&self, workspace: &Path) -> Result<()>;
}

/// Clones learner repositories under a common root
pub struct GitWorkspaces {
    root: PathBuf,
}

impl GitWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for one revision, unique per (repository, commit)
    pub fn workspace_dir(&self, repo_url: &str, commit_sha: &str) -> PathBuf {
        self.root.join(format!("{}-{}", repo_name(repo_url), commit_sha))
    }

    async fn checkout(&self, dir: &Path, repo_url: &str, branch: &str, commit_sha: &str) -> Result<()> {
        let target = dir.to_string_lossy().into_owned();
        git::run(["clone", "--branch", branch, "--", repo_url, target.as_str()], None)
            .await
            .with_context(|| format!("git clone of {} failed", repo_url))?;

        git::run(["checkout", commit_sha], Some(dir))
            .await
            .with_context(|| format!("git checkout of {} failed", commit_sha))?;

        tokio::fs::create_dir_all(dir.join(METADATA_DIR))
            .await
            .context("Failed to create workspace metadata directory")?;

        let entry_point = dir.join(ENTRY_POINT);
        if tokio::fs::try_exists(&entry_point).await.unwrap_or(false) {
            make_executable(&entry_point).await?;
        } else {
            debug!(workspace = %dir.display(), "{} not found in repository", ENTRY_POINT);
        }

        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorkspaces {
    async fn provision(&self, repo_url: &str, branch: &str, commit_sha: &str) -> Result<PathBuf> {
        let dir = self.workspace_dir(repo_url, commit_sha);

        // Left behind by an earlier delivery of the same revision
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            warn!(workspace = %dir.display(), "Removing stale workspace");
            remove_tree(&dir).await?;
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create workspace root {}", self.root.display()))?;

        info!(repo_url, branch, commit_sha, workspace = %dir.display(), "Cloning repository");

        if let Err(e) = self.checkout(&dir, repo_url, branch, commit_sha).await {
            if let Err(cleanup) = remove_tree(&dir).await {
                warn!(workspace = %dir.display(), error = %cleanup, "Failed to remove partial checkout");
            }
            return Err(e);
        }

        info!(workspace = %dir.display(), "Workspace ready");
        Ok(dir)
    }

    async fn release(&self, workspace: &Path) -> Result<()> {
        remove_tree(workspace).await?;
        info!(workspace = %workspace.display(), "Workspace released");
        Ok(())
    }
}

/// Last path segment of a repository URL without `.git`, safe for a directory name
pub fn repo_name(repo_url: &str) -> String {
    let last = repo_url
        .trim_end_matches('/')
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);

    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        "repo".to_string()
    } else {
        cleaned
    }
}

async fn remove_tree(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("Failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
