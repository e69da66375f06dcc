/// Job Orchestrator - The Job Lifecycle Pipeline
///
/// **Responsibility:**
/// Decide what a job means for the learner's current progress, drive the
/// sandbox and the log hub accordingly, and report exactly one result.
///
/// **Branches:**
/// - `completed`   → tell the viewer, report success, nothing else
/// - `not_started` → provision the workspace only, report success
/// - `in_progress` → provision, scaffold, build, run the stage, report
/// - any failure   → report a failure with the best captured text
///
/// Whatever branch runs, the workspace and the sandbox image are released
/// exactly once and the viewer stream is closed before `run` returns.

use crate::detect::detect_language;
use crate::error::JobError;
use crate::fixtures::TestFixtureProvider;
use crate::log_hub::LogHub;
use crate::metrics;
use crate::progress::ProgressProvider;
use crate::reporter::ResultReporter;
use crate::sandbox::{image_name, ExecutionOutcome, SandboxExecutor};
use crate::scaffold;
use crate::workspace::WorkspaceProvisioner;
use futures_util::FutureExt;
use stagerun_common::types::{JobRequest, JobResult, ProgressStatus};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const ALREADY_COMPLETED_MESSAGE: &str =
    "You have already completed this challenge. No further testing is needed.";
pub const SETUP_COMPLETED_MESSAGE: &str =
    "Repository setup completed. Push your first change to run stage 1.";
pub const STARTING_TESTS_MESSAGE: &str = "Starting test process...";

/// External collaborators, injected once per process
#[derive(Clone)]
pub struct Collaborators {
    pub progress: Arc<dyn ProgressProvider>,
    pub reporter: Arc<dyn ResultReporter>,
    pub workspaces: Arc<dyn WorkspaceProvisioner>,
    pub fixtures: Arc<dyn TestFixtureProvider>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub hub: LogHub,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long the `completed` branch waits for a viewer before speaking
    pub viewer_attach_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            viewer_attach_timeout: Duration::from_secs(5),
        }
    }
}

/// Resources a job has acquired and must give back
#[derive(Debug, Default)]
struct JobResources {
    workspace: Option<PathBuf>,
    image: Option<String>,
}

/// Serialises overlapping deliveries of the same job id
#[derive(Default)]
struct JobLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLocks {
    async fn acquire(&self, job_id: &str) -> JobLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(job_id.to_string()).or_default().clone()
        };

        let guard = lock.clone().lock_owned().await;
        JobLockGuard {
            locks: self,
            job_id: job_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

struct JobLockGuard<'a> {
    locks: &'a JobLocks,
    job_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for JobLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map and this guard hold the lock: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.job_id);
        }
    }
}

pub struct JobOrchestrator {
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    locks: JobLocks,
}

impl JobOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        Self {
            collaborators,
            settings,
            locks: JobLocks::default(),
        }
    }

    pub fn hub(&self) -> &LogHub {
        &self.collaborators.hub
    }

    /// Process one job to completion. Never fails and never panics outward:
    /// every error ends up in the reported result.
    pub async fn run(&self, request: JobRequest) {
        let job_id = request.job_id().to_string();
        let _serial = self.locks.acquire(&job_id).await;

        let started = Instant::now();
        metrics::JOBS_IN_FLIGHT.inc();
        info!(commit_sha = %job_id, repo_url = %request.repo_url, branch = %request.branch, "Job started");

        let mut resources = JobResources::default();
        let pipeline = AssertUnwindSafe(self.execute(&request, &mut resources))
            .catch_unwind()
            .await;

        let (result, outcome) = match pipeline {
            Ok(Ok(result)) => {
                let outcome = if result.success { "success" } else { "failure" };
                (result, outcome)
            }
            Ok(Err(err)) => {
                let outcome = err.kind();
                (self.failure_result(&job_id, err), outcome)
            }
            Err(panic) => {
                let err = JobError::Panicked(panic_message(panic.as_ref()));
                (self.failure_result(&job_id, err), "panic")
            }
        };

        self.report(&job_id, &result).await;
        self.release(&job_id, resources).await;
        self.hub().close(&job_id);

        metrics::JOBS_IN_FLIGHT.dec();
        metrics::record_job_finished(outcome, started.elapsed().as_secs_f64());
        info!(
            commit_sha = %job_id,
            success = result.success,
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
    }

    async fn execute(
        &self,
        request: &JobRequest,
        resources: &mut JobResources,
    ) -> Result<JobResult, JobError> {
        validate_job_id(request.job_id())?;

        let progress = self
            .collaborators
            .progress
            .fetch(&request.repo_url)
            .await
            .map_err(|e| JobError::Lookup(format!("{:#}", e)))?
            .ok_or_else(|| {
                JobError::Lookup(format!("no progress record for {}", request.repo_url))
            })?;

        let challenge_id = progress
            .challenge_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                JobError::Lookup(format!(
                    "progress record for {} has no challenge id",
                    request.repo_url
                ))
            })?;

        info!(
            commit_sha = %request.commit_sha,
            challenge_id,
            status = %progress.status,
            stage = progress.current_stage,
            "Progress resolved"
        );

        match progress.status {
            ProgressStatus::Completed => Ok(self.already_completed(request.job_id()).await),
            ProgressStatus::NotStarted => self.setup_only(request, resources).await,
            ProgressStatus::InProgress => {
                self.run_stage(request, challenge_id, progress.current_stage, resources)
                    .await
            }
        }
    }

    async fn already_completed(&self, job_id: &str) -> JobResult {
        let hub = self.hub();
        if !hub
            .await_attachment(job_id, self.settings.viewer_attach_timeout)
            .await
        {
            debug!(commit_sha = job_id, "No viewer attached before timeout");
        }

        hub.send(job_id, ALREADY_COMPLETED_MESSAGE);
        JobResult::success("Challenge already completed. No further testing needed.")
    }

    async fn setup_only(
        &self,
        request: &JobRequest,
        resources: &mut JobResources,
    ) -> Result<JobResult, JobError> {
        self.provision(request, resources).await?;

        self.hub().send(request.job_id(), SETUP_COMPLETED_MESSAGE);
        Ok(JobResult::success("Repository setup completed successfully."))
    }

    async fn run_stage(
        &self,
        request: &JobRequest,
        challenge_id: &str,
        stage: u32,
        resources: &mut JobResources,
    ) -> Result<JobResult, JobError> {
        let job_id = request.job_id();
        let hub = self.hub();
        let workspace = self.provision(request, resources).await?;

        let language = detect_language(&workspace).ok_or_else(|| {
            JobError::UnsupportedLanguage("could not detect the repository language".to_string())
        })?;
        info!(commit_sha = job_id, %language, stage, "Language detected");

        let fixture = self
            .collaborators
            .fixtures
            .fetch(challenge_id, language, stage)
            .await
            .map_err(JobError::Fixture)?;

        let scaffold =
            scaffold::prepare(&workspace, language, stage, fixture.as_deref()).await?;
        debug!(
            commit_sha = job_id,
            fixture = ?scaffold.fixture,
            run_script = %scaffold.run_script.display(),
            dockerfile = %scaffold.dockerfile.display(),
            "Workspace scaffolded"
        );

        let image = image_name(job_id);
        // Recorded before building so a half-finished build is still torn down
        resources.image = Some(image.clone());
        hub.send(job_id, format!("Building {} environment for stage {}...", language, stage));
        self.collaborators
            .sandbox
            .build(&workspace, &image)
            .await
            .map_err(JobError::Build)?;

        hub.send(job_id, STARTING_TESTS_MESSAGE);
        let outcome = self
            .collaborators
            .sandbox
            .run(&image, &scaffold::sandbox_command())
            .await
            .map_err(JobError::Execution)?;

        Ok(self.stage_result(job_id, outcome))
    }

    async fn provision(
        &self,
        request: &JobRequest,
        resources: &mut JobResources,
    ) -> Result<PathBuf, JobError> {
        let workspace = self
            .collaborators
            .workspaces
            .provision(&request.repo_url, &request.branch, &request.commit_sha)
            .await
            .map_err(JobError::Provision)?;

        resources.workspace = Some(workspace.clone());
        Ok(workspace)
    }

    /// Pass/fail is the exit code alone; output text is never inspected
    fn stage_result(&self, job_id: &str, outcome: ExecutionOutcome) -> JobResult {
        let hub = self.hub();

        if !outcome.stdout.is_empty() {
            hub.send(job_id, outcome.stdout.as_str());
        }

        if outcome.succeeded() {
            return JobResult::success(outcome.stdout);
        }

        // stderr only reaches the viewer on failure so incidental warnings
        // don't clutter passing runs
        if !outcome.stderr.is_empty() {
            hub.send(job_id, outcome.stderr.as_str());
        }

        JobResult::failure(
            format!("{}\n{}", outcome.stderr, outcome.stdout),
            format!("Tests failed with exit code {}", outcome.exit_code),
        )
    }

    fn failure_result(&self, job_id: &str, err: JobError) -> JobResult {
        error!(commit_sha = job_id, error = %err, kind = err.kind(), "Job failed");

        let message = err.user_message();
        self.hub().send(job_id, format!("Error: {}", message));
        JobResult::failure(err.captured_output(), message)
    }

    async fn report(&self, job_id: &str, result: &JobResult) {
        match self.collaborators.reporter.report(job_id, result).await {
            Ok(()) => debug!(commit_sha = job_id, "Result reported"),
            Err(e) => error!(commit_sha = job_id, error = %format!("{:#}", e), "Failed to report result"),
        }
    }

    async fn release(&self, job_id: &str, resources: JobResources) {
        if let Some(workspace) = resources.workspace {
            if let Err(e) = self.collaborators.workspaces.release(&workspace).await {
                warn!(
                    commit_sha = job_id,
                    workspace = %workspace.display(),
                    error = %format!("{:#}", e),
                    "Failed to release workspace"
                );
            }
        }

        if let Some(image) = resources.image {
            self.collaborators.sandbox.destroy_image(&image).await;
        }
    }
}

/// Job ids name directories and image references, so they follow the
/// reference component grammar: alphanumeric runs joined by `.`, `_`, `__`
/// or a run of dashes
fn validate_job_id(job_id: &str) -> Result<(), JobError> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 128
        && job_id.starts_with(|c: char| c.is_ascii_alphanumeric())
        && job_id.ends_with(|c: char| c.is_ascii_alphanumeric())
        && job_id
            .split(|c: char| c.is_ascii_alphanumeric())
            .all(|sep| matches!(sep, "" | "." | "_" | "__") || sep.chars().all(|c| c == '-'));

    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidRequest(format!("malformed commit sha {:?}", job_id)))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_hub::{COMPLETED_MESSAGE, CONNECTED_MESSAGE};
    use crate::sandbox::SandboxError;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use stagerun_common::types::{Language, LogMessage, ProgressRecord};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    // ---- fakes -------------------------------------------------------

    struct FakeProgress(Option<ProgressRecord>);

    #[async_trait]
    impl ProgressProvider for FakeProgress {
        async fn fetch(&self, _repo_url: &str) -> Result<Option<ProgressRecord>> {
            Ok(self.0.clone())
        }
    }

    struct FailingProgress;

    #[async_trait]
    impl ProgressProvider for FailingProgress {
        async fn fetch(&self, _repo_url: &str) -> Result<Option<ProgressRecord>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<(String, JobResult)>>,
        fail: bool,
    }

    #[async_trait]
    impl ResultReporter for RecordingReporter {
        async fn report(&self, commit_sha: &str, result: &JobResult) -> Result<()> {
            self.reports
                .lock()
                .unwrap()
                .push((commit_sha.to_string(), result.clone()));
            if self.fail {
                return Err(anyhow!("result queue unavailable"));
            }
            Ok(())
        }
    }

    /// Creates real directories under a temp root, seeded with a language marker
    struct FakeWorkspaces {
        root: tempfile::TempDir,
        marker: Option<&'static str>,
        fail: bool,
        provisioned: AtomicUsize,
        released: Mutex<Vec<PathBuf>>,
    }

    impl FakeWorkspaces {
        fn new(marker: Option<&'static str>) -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                marker,
                fail: false,
                provisioned: AtomicUsize::new(0),
                released: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(None)
            }
        }

        fn provisioned(&self) -> usize {
            self.provisioned.load(Ordering::SeqCst)
        }

        fn released(&self) -> Vec<PathBuf> {
            self.released.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkspaceProvisioner for FakeWorkspaces {
        async fn provision(&self, _repo_url: &str, _branch: &str, commit_sha: &str) -> Result<PathBuf> {
            if self.fail {
                return Err(anyhow!("repository not found"));
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            let dir = self.root.path().join(commit_sha);
            std::fs::create_dir_all(&dir)?;
            if let Some(marker) = self.marker {
                std::fs::write(dir.join(marker), "")?;
            }
            Ok(dir)
        }

        async fn release(&self, workspace: &Path) -> Result<()> {
            self.released.lock().unwrap().push(workspace.to_path_buf());
            Ok(())
        }
    }

    struct FakeFixtures {
        content: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl TestFixtureProvider for FakeFixtures {
        async fn fetch(&self, _challenge_id: &str, _language: Language, _stage: u32) -> Result<Option<String>> {
            if self.fail {
                return Err(anyhow!("fixture repository unreachable"));
            }
            Ok(self.content.clone())
        }
    }

    enum RunBehaviour {
        Exit(ExecutionOutcome),
        Fail(SandboxError),
        Panic,
    }

    struct FakeSandbox {
        build_error: Mutex<Option<SandboxError>>,
        run: Mutex<Option<RunBehaviour>>,
        builds: Mutex<Vec<(PathBuf, String)>>,
        runs: Mutex<Vec<(String, Vec<String>)>>,
        destroyed: Mutex<Vec<String>>,
    }

    impl FakeSandbox {
        fn exiting(exit_code: i64, stdout: &str, stderr: &str) -> Self {
            Self::with_run(RunBehaviour::Exit(ExecutionOutcome {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            }))
        }

        fn with_run(run: RunBehaviour) -> Self {
            Self {
                build_error: Mutex::new(None),
                run: Mutex::new(Some(run)),
                builds: Mutex::new(Vec::new()),
                runs: Mutex::new(Vec::new()),
                destroyed: Mutex::new(Vec::new()),
            }
        }

        fn failing_build(message: &str, log: &str) -> Self {
            let sandbox = Self::exiting(0, "", "");
            *sandbox.build_error.lock().unwrap() = Some(SandboxError::Build {
                message: message.to_string(),
                log: log.to_string(),
            });
            sandbox
        }

        fn builds(&self) -> usize {
            self.builds.lock().unwrap().len()
        }

        fn runs(&self) -> usize {
            self.runs.lock().unwrap().len()
        }

        fn destroyed(&self) -> Vec<String> {
            self.destroyed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SandboxExecutor for FakeSandbox {
        async fn build(&self, workspace: &Path, image: &str) -> Result<(), SandboxError> {
            self.builds
                .lock()
                .unwrap()
                .push((workspace.to_path_buf(), image.to_string()));
            match self.build_error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn run(&self, image: &str, command: &[String]) -> Result<ExecutionOutcome, SandboxError> {
            self.runs
                .lock()
                .unwrap()
                .push((image.to_string(), command.to_vec()));
            let behaviour = self.run.lock().unwrap().take();
            match behaviour {
                Some(RunBehaviour::Exit(outcome)) => Ok(outcome),
                Some(RunBehaviour::Fail(err)) => Err(err),
                Some(RunBehaviour::Panic) => panic!("runtime crashed"),
                None => Ok(ExecutionOutcome::default()),
            }
        }

        async fn destroy_image(&self, image: &str) {
            self.destroyed.lock().unwrap().push(image.to_string());
        }
    }

    // ---- harness -----------------------------------------------------

    struct Harness {
        orchestrator: JobOrchestrator,
        reporter: Arc<RecordingReporter>,
        workspaces: Arc<FakeWorkspaces>,
        sandbox: Arc<FakeSandbox>,
        hub: LogHub,
    }

    impl Harness {
        fn build(
            progress: Arc<dyn ProgressProvider>,
            reporter: RecordingReporter,
            workspaces: FakeWorkspaces,
            fixtures: FakeFixtures,
            sandbox: FakeSandbox,
        ) -> Self {
            let reporter = Arc::new(reporter);
            let workspaces = Arc::new(workspaces);
            let sandbox = Arc::new(sandbox);
            let hub = LogHub::new();

            let orchestrator = JobOrchestrator::new(
                Collaborators {
                    progress,
                    reporter: reporter.clone(),
                    workspaces: workspaces.clone(),
                    fixtures: Arc::new(fixtures),
                    sandbox: sandbox.clone(),
                    hub: hub.clone(),
                },
                OrchestratorSettings {
                    viewer_attach_timeout: Duration::from_millis(50),
                },
            );

            Self {
                orchestrator,
                reporter,
                workspaces,
                sandbox,
                hub,
            }
        }

        fn in_progress(stage: u32, sandbox: FakeSandbox) -> Self {
            Self::build(
                Arc::new(FakeProgress(Some(record(ProgressStatus::InProgress, stage)))),
                RecordingReporter::default(),
                FakeWorkspaces::new(Some("requirements.txt")),
                FakeFixtures {
                    content: Some("def test_stage(): pass\n".to_string()),
                    fail: false,
                },
                sandbox,
            )
        }

        fn with_status(status: ProgressStatus) -> Self {
            Self::build(
                Arc::new(FakeProgress(Some(record(status, 1)))),
                RecordingReporter::default(),
                FakeWorkspaces::new(Some("package.json")),
                FakeFixtures {
                    content: None,
                    fail: false,
                },
                FakeSandbox::exiting(0, "", ""),
            )
        }

        fn viewer(&self, job_id: &str) -> mpsc::UnboundedReceiver<LogMessage> {
            let (sink, receiver) = mpsc::unbounded_channel();
            self.hub.attach(job_id, sink).unwrap();
            receiver
        }

        fn reports(&self) -> Vec<(String, JobResult)> {
            self.reporter.reports.lock().unwrap().clone()
        }

        fn single_report(&self) -> JobResult {
            let reports = self.reports();
            assert_eq!(reports.len(), 1, "expected exactly one report");
            reports[0].1.clone()
        }
    }

    fn record(status: ProgressStatus, stage: u32) -> ProgressRecord {
        ProgressRecord {
            challenge_id: Some("http-server".to_string()),
            status,
            current_stage: stage,
        }
    }

    fn request() -> JobRequest {
        JobRequest::new("repo-x", "main", "abc123")
    }

    fn messages(receiver: &mut mpsc::UnboundedReceiver<LogMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = receiver.try_recv() {
            out.push(msg.message);
        }
        out
    }

    // ---- in_progress -------------------------------------------------

    #[tokio::test]
    async fn test_passing_stage_reports_stdout() {
        let harness = Harness::in_progress(2, FakeSandbox::exiting(0, "3 passed", ""));

        harness.orchestrator.run(request()).await;

        let reports = harness.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "abc123");
        assert_eq!(reports[0].1, JobResult::success("3 passed"));
    }

    #[tokio::test]
    async fn test_failing_stage_reports_stderr_then_stdout() {
        let harness = Harness::in_progress(
            2,
            FakeSandbox::exiting(1, "", "assertion failed at line 4"),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert_eq!(result.output, "assertion failed at line 4\n");
        assert_eq!(result.error_message.as_deref(), Some("Tests failed with exit code 1"));
    }

    #[tokio::test]
    async fn test_success_ignores_failure_words_in_output() {
        let harness = Harness::in_progress(
            1,
            FakeSandbox::exiting(0, "test_parse ... failed to reproduce: error is expected", ""),
        );

        harness.orchestrator.run(request()).await;

        assert!(harness.single_report().success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_clean_stdout() {
        let harness = Harness::in_progress(1, FakeSandbox::exiting(3, "all tests passed", ""));

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert_eq!(result.output, "\nall tests passed");
    }

    #[tokio::test]
    async fn test_stage_builds_named_image_and_cleans_up() {
        let harness = Harness::in_progress(2, FakeSandbox::exiting(0, "ok", ""));

        harness.orchestrator.run(request()).await;

        let builds = harness.sandbox.builds.lock().unwrap().clone();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].1, "stagerun-abc123");

        let runs = harness.sandbox.runs.lock().unwrap().clone();
        assert_eq!(runs, vec![("stagerun-abc123".to_string(), scaffold::sandbox_command())]);

        assert_eq!(harness.sandbox.destroyed(), vec!["stagerun-abc123"]);
        assert_eq!(harness.workspaces.released(), vec![builds[0].0.clone()]);
    }

    #[tokio::test]
    async fn test_fixture_and_script_written_before_build() {
        let harness = Harness::in_progress(2, FakeSandbox::exiting(0, "ok", ""));

        harness.orchestrator.run(request()).await;

        // The fake release only records, so the files are still on disk
        let workspace = harness.workspaces.released()[0].clone();
        let fixture = std::fs::read_to_string(workspace.join("app/stage2_test.py")).unwrap();
        assert_eq!(fixture, "def test_stage(): pass\n");
        let script = std::fs::read_to_string(workspace.join(".stagerun/run.sh")).unwrap();
        assert!(script.contains("pytest ./app/stage2_test.py -v"));
    }

    #[tokio::test]
    async fn test_viewer_sees_progress_and_output() {
        let harness = Harness::in_progress(2, FakeSandbox::exiting(0, "3 passed", "warning: noisy"));
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        let seen = messages(&mut viewer);
        assert_eq!(seen.first().map(String::as_str), Some(CONNECTED_MESSAGE));
        assert!(seen.contains(&STARTING_TESTS_MESSAGE.to_string()));
        assert!(seen.contains(&"3 passed".to_string()));
        // stderr stays out of passing runs
        assert!(!seen.contains(&"warning: noisy".to_string()));
        assert_eq!(seen.last().map(String::as_str), Some(COMPLETED_MESSAGE));
        assert!(!harness.hub.is_attached("abc123"));
    }

    #[tokio::test]
    async fn test_viewer_sees_stderr_on_failure() {
        let harness = Harness::in_progress(2, FakeSandbox::exiting(1, "", "assertion failed"));
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        assert!(messages(&mut viewer).contains(&"assertion failed".to_string()));
    }

    #[tokio::test]
    async fn test_unsupported_language_releases_workspace() {
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::InProgress, 1)))),
            RecordingReporter::default(),
            FakeWorkspaces::new(None),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("unsupported workspace"));
        assert_eq!(harness.workspaces.released().len(), 1);
        assert_eq!(harness.sandbox.builds(), 0);
        assert!(harness.sandbox.destroyed().is_empty());
    }

    // ---- failure paths -----------------------------------------------

    #[tokio::test]
    async fn test_missing_progress_record() {
        let harness = Harness::build(
            Arc::new(FakeProgress(None)),
            RecordingReporter::default(),
            FakeWorkspaces::new(Some("Cargo.toml")),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("progress"));
        assert_eq!(harness.workspaces.provisioned(), 0);
        assert!(harness.workspaces.released().is_empty());
    }

    #[tokio::test]
    async fn test_progress_without_challenge_id() {
        let mut progress = record(ProgressStatus::InProgress, 1);
        progress.challenge_id = None;
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(progress))),
            RecordingReporter::default(),
            FakeWorkspaces::new(Some("Cargo.toml")),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(result.error_message.unwrap().contains("no challenge id"));
        assert_eq!(harness.workspaces.provisioned(), 0);
    }

    #[tokio::test]
    async fn test_progress_service_error() {
        let harness = Harness::build(
            Arc::new(FailingProgress),
            RecordingReporter::default(),
            FakeWorkspaces::new(Some("Cargo.toml")),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert_eq!(
            result.error_message.as_deref(),
            Some("progress lookup failed: connection refused")
        );
    }

    #[tokio::test]
    async fn test_provision_failure_reports_once() {
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::InProgress, 1)))),
            RecordingReporter::default(),
            FakeWorkspaces::failing(),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("repository not found"));
        assert!(harness.workspaces.released().is_empty());
        assert_eq!(harness.sandbox.builds(), 0);

        let seen = messages(&mut viewer);
        assert!(seen.iter().any(|m| m.starts_with("Error: workspace provisioning failed")));
        assert_eq!(seen.last().map(String::as_str), Some(COMPLETED_MESSAGE));
    }

    #[tokio::test]
    async fn test_fixture_failure_releases_workspace() {
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::InProgress, 1)))),
            RecordingReporter::default(),
            FakeWorkspaces::new(Some("Cargo.toml")),
            FakeFixtures {
                content: None,
                fail: true,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(result.error_message.unwrap().contains("fixture repository unreachable"));
        assert_eq!(harness.workspaces.released().len(), 1);
        assert_eq!(harness.sandbox.builds(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_prefers_build_log_and_destroys_image() {
        let harness = Harness::in_progress(
            1,
            FakeSandbox::failing_build("exit code 1", "error[E0425]: cannot find value `x`"),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert_eq!(
            result.error_message.as_deref(),
            Some("error[E0425]: cannot find value `x`")
        );
        assert_eq!(harness.sandbox.runs(), 0);
        assert_eq!(harness.sandbox.destroyed(), vec!["stagerun-abc123"]);
        assert_eq!(harness.workspaces.released().len(), 1);
    }

    #[tokio::test]
    async fn test_run_error_still_cleans_up_once() {
        let harness = Harness::in_progress(
            1,
            FakeSandbox::with_run(RunBehaviour::Fail(SandboxError::Run {
                message: "failed to start container".to_string(),
                stderr: String::new(),
            })),
        );

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert_eq!(
            result.error_message.as_deref(),
            Some("sandbox run failed: container run failed: failed to start container")
        );
        assert_eq!(harness.sandbox.destroyed().len(), 1);
        assert_eq!(harness.workspaces.released().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_pipeline_is_contained() {
        let harness = Harness::in_progress(1, FakeSandbox::with_run(RunBehaviour::Panic));
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("runtime crashed"));
        assert_eq!(harness.sandbox.destroyed().len(), 1);
        assert_eq!(harness.workspaces.released().len(), 1);
        assert_eq!(messages(&mut viewer).last().map(String::as_str), Some(COMPLETED_MESSAGE));
    }

    #[tokio::test]
    async fn test_reporter_failure_does_not_stop_cleanup() {
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::InProgress, 1)))),
            RecordingReporter {
                fail: true,
                ..Default::default()
            },
            FakeWorkspaces::new(Some("Cargo.toml")),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "ok", ""),
        );

        harness.orchestrator.run(request()).await;

        assert_eq!(harness.reports().len(), 1);
        assert_eq!(harness.workspaces.released().len(), 1);
        assert_eq!(harness.sandbox.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_commit_sha_rejected_early() {
        let harness = Harness::in_progress(1, FakeSandbox::exiting(0, "", ""));

        harness
            .orchestrator
            .run(JobRequest::new("repo-x", "main", "../../etc"))
            .await;

        let result = harness.single_report();
        assert!(result.error_message.unwrap().contains("malformed commit sha"));
        assert_eq!(harness.workspaces.provisioned(), 0);
    }

    // ---- short-circuit branches --------------------------------------

    #[tokio::test]
    async fn test_completed_skips_workspace_and_sandbox() {
        let harness = Harness::with_status(ProgressStatus::Completed);
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(result.success);
        assert_eq!(harness.workspaces.provisioned(), 0);
        assert_eq!(harness.sandbox.builds(), 0);
        assert_eq!(
            messages(&mut viewer),
            vec![CONNECTED_MESSAGE, ALREADY_COMPLETED_MESSAGE, COMPLETED_MESSAGE]
        );
    }

    #[tokio::test]
    async fn test_completed_waits_for_late_viewer() {
        let harness = Arc::new(Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::Completed, 4)))),
            RecordingReporter::default(),
            FakeWorkspaces::new(None),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        ));

        let (sink, mut viewer) = mpsc::unbounded_channel();
        let hub = harness.hub.clone();
        let attach = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            hub.attach("abc123", sink);
        });

        harness.orchestrator.run(request()).await;
        attach.await.unwrap();

        assert!(messages(&mut viewer).contains(&ALREADY_COMPLETED_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn test_completed_without_viewer_still_reports() {
        let harness = Harness::with_status(ProgressStatus::Completed);

        harness.orchestrator.run(request()).await;

        assert!(harness.single_report().success);
    }

    #[tokio::test]
    async fn test_not_started_provisions_only() {
        let harness = Harness::with_status(ProgressStatus::NotStarted);
        let mut viewer = harness.viewer("abc123");

        harness.orchestrator.run(request()).await;

        let result = harness.single_report();
        assert!(result.success);
        assert_eq!(harness.workspaces.provisioned(), 1);
        assert_eq!(harness.workspaces.released().len(), 1);
        assert_eq!(harness.sandbox.builds(), 0);
        assert_eq!(harness.sandbox.runs(), 0);
        assert!(harness.sandbox.destroyed().is_empty());
        assert!(messages(&mut viewer).contains(&SETUP_COMPLETED_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn test_not_started_with_unreachable_repo_fails() {
        let harness = Harness::build(
            Arc::new(FakeProgress(Some(record(ProgressStatus::NotStarted, 0)))),
            RecordingReporter::default(),
            FakeWorkspaces::failing(),
            FakeFixtures {
                content: None,
                fail: false,
            },
            FakeSandbox::exiting(0, "", ""),
        );

        harness.orchestrator.run(request()).await;

        assert!(!harness.single_report().success);
    }

    // ---- concurrency -------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_deliveries_each_report_and_release() {
        let harness = Arc::new(Harness::in_progress(1, FakeSandbox::exiting(0, "ok", "")));

        let first = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.orchestrator.run(request()).await })
        };
        let second = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.orchestrator.run(request()).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(harness.reports().len(), 2);
        assert_eq!(harness.workspaces.released().len(), 2);
        assert_eq!(harness.sandbox.destroyed().len(), 2);
        assert!(harness.orchestrator.locks.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_validate_job_id() {
        assert!(validate_job_id("4f2a9c1e").is_ok());
        assert!(validate_job_id("release-1.2_rc").is_ok());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("-rf").is_err());
        assert!(validate_job_id("a/b").is_err());
        assert!(validate_job_id("sha with space").is_err());
        assert!(validate_job_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_job_id_follows_reference_separators() {
        assert!(validate_job_id("a__b").is_ok());
        assert!(validate_job_id("a---b").is_ok());
        assert!(validate_job_id("v1.2.3").is_ok());
        assert!(validate_job_id("a..b").is_err());
        assert!(validate_job_id("a._b").is_err());
        assert!(validate_job_id("a___b").is_err());
        assert!(validate_job_id("a-.b").is_err());
        assert!(validate_job_id("abc.").is_err());
        assert!(validate_job_id("abc-").is_err());
        assert!(validate_job_id("_abc").is_err());
        assert!(validate_job_id(".abc").is_err());
    }
}
