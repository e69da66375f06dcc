/// Job Error Taxonomy
///
/// Every failure inside the pipeline becomes one of these and is turned into
/// a failed `JobResult` at the top of `JobOrchestrator::run`. None of them
/// escape to the transport layer.

use crate::sandbox::SandboxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("progress lookup failed: {0}")]
    Lookup(String),

    #[error("unsupported workspace: {0}")]
    UnsupportedLanguage(String),

    #[error("workspace provisioning failed: {0:#}")]
    Provision(anyhow::Error),

    #[error("failed to load test fixture: {0:#}")]
    Fixture(anyhow::Error),

    #[error("failed to prepare workspace: {0}")]
    Prepare(#[from] std::io::Error),

    #[error("sandbox build failed: {0}")]
    Build(#[source] SandboxError),

    #[error("sandbox run failed: {0}")]
    Execution(#[source] SandboxError),

    #[error("job aborted unexpectedly: {0}")]
    Panicked(String),
}

impl JobError {
    /// Best available text for the learner: output captured by the
    /// execution layer wins over the generic error message.
    pub fn user_message(&self) -> String {
        match self {
            JobError::Build(e) | JobError::Execution(e) => match e.captured_output() {
                Some(captured) if !captured.trim().is_empty() => captured.to_string(),
                _ => self.to_string(),
            },
            _ => self.to_string(),
        }
    }

    /// Output captured before the fault, if any
    pub fn captured_output(&self) -> String {
        match self {
            JobError::Build(e) | JobError::Execution(e) => {
                e.captured_output().unwrap_or_default().to_string()
            }
            _ => String::new(),
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InvalidRequest(_) => "invalid_request",
            JobError::Lookup(_) => "lookup",
            JobError::UnsupportedLanguage(_) => "unsupported_language",
            JobError::Provision(_) => "provision",
            JobError::Fixture(_) => "fixture",
            JobError::Prepare(_) => "prepare",
            JobError::Build(_) => "build",
            JobError::Execution(_) => "execution",
            JobError::Panicked(_) => "panic",
        }
    }
}
