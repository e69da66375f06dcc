use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry point every learner repository may ship. Run when a stage has no fixture.
pub const ENTRY_POINT: &str = "your_program.sh";

/// Directory inside a workspace that holds generated build and run files.
pub const METADATA_DIR: &str = ".stagerun";

/// Supported learner languages
///
/// Each variant carries its own sandbox profile: base image, setup commands,
/// fixture location and stage command. Adding a language means adding an arm
/// to each match below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Rust,
    TypeScript,
}

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for available languages
    pub fn all_variants() -> &'static [Language] {
        &[Language::Python, Language::Rust, Language::TypeScript]
    }

    /// Parse a language from its name (case-insensitive)
    pub fn from_name(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "python" => Some(Language::Python),
            "rust" => Some(Language::Rust),
            "typescript" | "ts" => Some(Language::TypeScript),
            _ => None,
        }
    }

    pub fn base_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.12-slim",
            Language::Rust => "rust:1-slim",
            Language::TypeScript => "oven/bun:1",
        }
    }

    /// Commands baked into the sandbox image after the workspace is copied in
    pub fn setup_commands(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &[
                "pip install --no-cache-dir pytest",
                "if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi",
            ],
            Language::Rust => &["cargo fetch"],
            Language::TypeScript => &["bun install"],
        }
    }

    pub fn test_file_suffix(&self) -> &'static str {
        match self {
            Language::Python => "_test.py",
            Language::Rust => "_test.rs",
            Language::TypeScript => ".test.ts",
        }
    }

    /// File name of a stage fixture, as stored in the fixture repository
    pub fn fixture_file_name(&self, stage: u32) -> String {
        format!("stage{}{}", stage, self.test_file_suffix())
    }

    /// Workspace-relative path the stage fixture is written to
    pub fn fixture_path(&self, stage: u32) -> String {
        let dir = match self {
            Language::Python | Language::TypeScript => "app",
            Language::Rust => "tests",
        };
        format!("{}/{}", dir, self.fixture_file_name(stage))
    }

    /// Shell command that runs one stage inside the sandbox
    pub fn run_command(&self, stage: u32, has_fixture: bool) -> String {
        if !has_fixture {
            return format!("./{}", ENTRY_POINT);
        }

        match self {
            Language::Python => format!("pytest ./{} -v", self.fixture_path(stage)),
            Language::Rust => format!(
                "cargo build --quiet && cargo test --test stage{}_test",
                stage
            ),
            Language::TypeScript => format!("bun test ./{}", self.fixture_path(stage)),
        }
    }

    /// Build descriptor for the sandbox image
    pub fn dockerfile(&self) -> String {
        let mut lines = vec![
            format!("FROM {}", self.base_image()),
            "WORKDIR /app".to_string(),
            "COPY . .".to_string(),
        ];
        lines.extend(self.setup_commands().iter().map(|cmd| format!("RUN {}", cmd)));
        lines.join("\n") + "\n"
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Rust => write!(f, "rust"),
            Language::TypeScript => write!(f, "typescript"),
        }
    }
}

/// Job Input (Immutable)
/// One request to run a learner's current stage against a pushed revision.
/// `commit_sha` is the job id: it keys the log channel, the workspace
/// directory and the sandbox image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default, rename = "event_type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
}

impl JobRequest {
    pub fn new(
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        Self {
            event_type: None,
            repo_url: repo_url.into(),
            branch: branch.into(),
            commit_sha: commit_sha.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.commit_sha
    }
}

/// Learner lifecycle status as tracked by the progress service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::NotStarted => write!(f, "not_started"),
            ProgressStatus::InProgress => write!(f, "in_progress"),
            ProgressStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Progress Record (read-only input)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(default)]
    pub challenge_id: Option<String>,
    pub status: ProgressStatus,
    #[serde(default)]
    pub current_stage: u32,
}

/// Terminal outcome of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_message: None,
        }
    }

    pub fn failure(output: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error_message: Some(error_message.into()),
        }
    }
}

/// A `JobResult` correlated back to its job, as written to the result queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedResult {
    pub commit_sha: String,
    #[serde(flatten)]
    pub result: JobResult,
}

/// Payload of one viewer stream event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
}

impl LogMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
