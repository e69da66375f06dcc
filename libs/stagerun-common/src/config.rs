use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub job_queue: String,
    /// Names this worker's processing list; must be unique per worker
    pub worker_id: String,
    pub result_queue: String,
    pub progress_service_url: String,
    pub workspace_root: PathBuf,
    pub fixture_repo_url: Option<String>,
    pub fixture_repo_branch: String,
    pub fixture_tests_path: String,
    pub fixture_cache_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub viewer_attach_timeout_ms: u64,
    pub sandbox_run_timeout_secs: Option<u64>,
    pub sandbox_memory_mb: u64,
    pub sandbox_cpus: f64,
    pub http_port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// An explicit id wins, then the host name (the pod name under Kubernetes)
fn pick_worker_id(explicit: Option<String>, hostname: Option<String>) -> String {
    explicit
        .filter(|v| !v.trim().is_empty())
        .or_else(|| hostname.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "local".to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let scratch = env::temp_dir().join("stagerun");

        Self {
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            job_queue: env::var("JOB_QUEUE").unwrap_or_else(|_| crate::redis::job_queue()),
            worker_id: pick_worker_id(env::var("WORKER_ID").ok(), env::var("HOSTNAME").ok()),
            result_queue: env::var("RESULT_QUEUE")
                .unwrap_or_else(|_| crate::redis::result_queue()),
            progress_service_url: var_or("PROGRESS_SERVICE_URL", "http://localhost:3004"),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| scratch.join("workspaces")),
            fixture_repo_url: env::var("FIXTURE_REPO_URL").ok().filter(|v| !v.is_empty()),
            fixture_repo_branch: var_or("FIXTURE_REPO_BRANCH", "main"),
            fixture_tests_path: var_or("FIXTURE_TESTS_PATH", "tests"),
            fixture_cache_dir: env::var("FIXTURE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| scratch.join("fixtures")),
            max_concurrent_jobs: parsed_or("MAX_CONCURRENT_JOBS", 4usize).max(1),
            viewer_attach_timeout_ms: parsed_or("VIEWER_ATTACH_TIMEOUT_MS", 5000),
            sandbox_run_timeout_secs: env::var("SANDBOX_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0),
            sandbox_memory_mb: parsed_or("SANDBOX_MEMORY_MB", 1024),
            sandbox_cpus: parsed_or("SANDBOX_CPUS", 1.0),
            http_port: parsed_or("HTTP_PORT", 3000),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    pub fn viewer_attach_timeout(&self) -> Duration {
        Duration::from_millis(self.viewer_attach_timeout_ms)
    }

    pub fn sandbox_run_timeout(&self) -> Option<Duration> {
        self.sandbox_run_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
