// Stage test fixtures, read from a shared fixture repository

use crate::git;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use stagerun_common::types::Language;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait TestFixtureProvider: Send + Sync {
    /// Fixture content for one stage. `Ok(None)` when the stage has no
    /// fixture, in which case the workspace's own entry point runs instead.
    async fn fetch(&self, challenge_id: &str, language: Language, stage: u32) -> Result<Option<String>>;
}

/// Where fixture files come from
#[derive(Debug, Clone)]
pub enum FixtureSource {
    /// A git repository kept in sync in the checkout directory
    Git { url: String, branch: String },
    /// A directory managed outside the worker
    Local,
}

/// Process-wide fixture cache. Constructed once and shared by every job.
pub struct FixtureRepository {
    source: FixtureSource,
    checkout_dir: PathBuf,
    tests_path: String,
    sync: Mutex<()>,
}

impl FixtureRepository {
    pub fn new(source: FixtureSource, checkout_dir: impl Into<PathBuf>, tests_path: impl Into<String>) -> Self {
        Self {
            source,
            checkout_dir: checkout_dir.into(),
            tests_path: tests_path.into(),
            sync: Mutex::new(()),
        }
    }

    pub fn fixture_path(&self, challenge_id: &str, language: Language, stage: u32) -> PathBuf {
        self.checkout_dir
            .join(&self.tests_path)
            .join(challenge_id)
            .join(language.to_string())
            .join(language.fixture_file_name(stage))
    }

    /// Bring the checkout up to date. A failed pull keeps the existing checkout.
    async fn refresh(&self, force: bool) -> Result<()> {
        let FixtureSource::Git { url, branch } = &self.source else {
            return Ok(());
        };

        let _guard = self.sync.lock().await;
        let dir = self.checkout_dir.to_string_lossy().into_owned();

        if tokio::fs::try_exists(self.checkout_dir.join(".git")).await.unwrap_or(false) {
            match git::run(["pull", "--ff-only"], Some(&self.checkout_dir)).await {
                Ok(_) => info!(repo = %url, "Fixture repository updated"),
                Err(e) if force => return Err(e.context("Failed to update fixture repository")),
                Err(e) => warn!(repo = %url, error = %e, "Fixture update failed, using existing checkout"),
            }
            return Ok(());
        }

        if let Some(parent) = self.checkout_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        git::run(["clone", "--branch", branch.as_str(), "--", url.as_str(), dir.as_str()], None)
            .await
            .context("Failed to clone fixture repository")?;
        info!(repo = %url, "Fixture repository cloned");
        Ok(())
    }

    /// Pull the fixture repository now, failing if the pull fails
    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh(true).await
    }
}

#[async_trait]
impl TestFixtureProvider for FixtureRepository {
    async fn fetch(&self, challenge_id: &str, language: Language, stage: u32) -> Result<Option<String>> {
        ensure_path_segment(challenge_id)?;
        self.refresh(false).await?;

        let path = self.fixture_path(challenge_id, language, stage);
        read_optional(&path).await
    }
}

/// Challenge ids become directory names; keep them to one plain segment
fn ensure_path_segment(value: &str) -> Result<()> {
    let plain = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
        && !value.contains('\0');
    if !plain {
        bail!("invalid challenge id {:?}", value);
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            info!(fixture = %path.display(), "Test fixture loaded");
            Ok(Some(content))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(fixture = %path.display(), "No test fixture for this stage");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read fixture {}", path.display())),
    }
}
