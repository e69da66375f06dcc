// Progress service client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use stagerun_common::types::ProgressRecord;
use std::time::Duration;

/// Source of a learner's current challenge, stage and lifecycle status
#[async_trait]
pub trait ProgressProvider: Send + Sync {
    /// `Ok(None)` means the service has no record for this repository
    async fn fetch(&self, repo_url: &str) -> Result<Option<ProgressRecord>>;
}

pub struct HttpProgressProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProgressProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build progress service client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn progress_url(&self) -> String {
        format!("{}/progress", self.base_url)
    }
}

#[async_trait]
impl ProgressProvider for HttpProgressProvider {
    async fn fetch(&self, repo_url: &str) -> Result<Option<ProgressRecord>> {
        let response = self
            .client
            .get(self.progress_url())
            .query(&[("repoUrl", repo_url)])
            .send()
            .await
            .context("Progress service unreachable")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let record = response
            .error_for_status()
            .context("Progress service returned an error")?
            .json::<ProgressRecord>()
            .await
            .context("Malformed progress record")?;

        Ok(Some(record))
    }
}
