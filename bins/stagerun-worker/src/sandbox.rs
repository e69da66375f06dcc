/// Sandbox Executor - Isolated, Disposable Execution Environments
///
/// **Core Responsibility:**
/// Build an image from a workspace, run exactly one command in a throwaway
/// container, and tear both down again.
///
/// **Architectural Boundary:**
/// - Knows HOW to isolate (Docker via bollard)
/// - Knows nothing about stages, progress or grading
/// - Returns stdout and stderr separately; merging is the orchestrator's job
///
/// build / run / destroy are separate calls so the orchestrator can attempt
/// destruction whenever a build was started, whether or not a run followed.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use stagerun_common::types::METADATA_DIR;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Exit code reported when a bounded run is cut short
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Lines of build output kept for error reports
const BUILD_LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("failed to package workspace {}: {source}", path.display())]
    Package {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image build failed: {message}")]
    Build { message: String, log: String },

    #[error("container run failed: {message}")]
    Run { message: String, stderr: String },
}

impl SandboxError {
    /// Output the runtime produced before failing
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            SandboxError::Build { log, .. } => Some(log),
            SandboxError::Run { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Raw result of one sandboxed command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Sandbox executor trait
///
/// Implementations must guarantee:
/// 1. `build` never mutates the workspace
/// 2. `build` tolerates an existing image with the same name
/// 3. `run` removes its container on every path
/// 4. `destroy_image` never fails loudly
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn build(&self, workspace: &Path, image: &str) -> Result<(), SandboxError>;

    async fn run(&self, image: &str, command: &[String]) -> Result<ExecutionOutcome, SandboxError>;

    async fn destroy_image(&self, image: &str);
}

/// Image tag for a job. Revision ids are reused, so the same job always
/// maps to the same tag.
pub fn image_name(job_id: &str) -> String {
    format!("stagerun-{}", job_id.to_lowercase())
}

/// Container names combine the image with a random token so concurrent
/// runs from the same image never collide.
pub fn container_name(image: &str) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", image, &token[..8])
}

/// Resource ceilings applied to every container
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
        }
    }
}

/// Docker-backed sandbox
pub struct DockerSandbox {
    docker: Docker,
    limits: SandboxLimits,
    run_timeout: Option<Duration>,
}

impl DockerSandbox {
    pub async fn connect(run_timeout: Option<Duration>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(SandboxError::Connect)?;
        docker.ping().await.map_err(SandboxError::Connect)?;

        info!("Connected to Docker daemon");
        Ok(Self {
            docker,
            limits: SandboxLimits::default(),
            run_timeout,
        })
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Start the container and collect its output and exit code
    async fn drive(&self, container: &str) -> Result<ExecutionOutcome, SandboxError> {
        self.docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Run {
                message: format!("failed to start container: {}", e),
                stderr: String::new(),
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let collect = async {
            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs = self.docker.logs(container, logs_options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container, error = %e, "Log stream interrupted");
                        break;
                    }
                }
            }
        };

        let timed_out = match self.run_timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.is_err(),
            None => {
                collect.await;
                false
            }
        };

        if timed_out {
            warn!(container, "Sandbox run exceeded its time limit, killing container");
            if let Err(e) = self
                .docker
                .kill_container(container, None::<KillContainerOptions<String>>)
                .await
            {
                warn!(container, error = %e, "Failed to kill timed out container");
            }
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str("Test run timed out\n");
            return Ok(ExecutionOutcome {
                stdout,
                stderr,
                exit_code: TIMEOUT_EXIT_CODE,
            });
        }

        let exit_code = self.exit_code(container).await.map_err(|message| SandboxError::Run {
            message,
            stderr: stderr.clone(),
        })?;

        Ok(ExecutionOutcome {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn exit_code(&self, container: &str) -> Result<i64, String> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait = self.docker.wait_container(container, Some(wait_options));
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as a wait error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(format!("failed to wait for container: {}", e)),
            None => Err("container wait stream ended without a status".to_string()),
        }
    }

    async fn remove_container(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => debug!(container, "Container removed"),
            Err(e) => warn!(container, error = %e, "Failed to remove container"),
        }
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandbox {
    async fn build(&self, workspace: &Path, image: &str) -> Result<(), SandboxError> {
        let root = workspace.to_path_buf();
        let context = tokio::task::spawn_blocking(move || package_context(&root))
            .await
            .map_err(|e| SandboxError::Package {
                path: workspace.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|source| SandboxError::Package {
                path: workspace.to_path_buf(),
                source,
            })?;

        let dockerfile = format!("{}/Dockerfile", METADATA_DIR);
        let options = BuildImageOptions {
            dockerfile: dockerfile.as_str(),
            t: image,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(image, context_bytes = context.len(), "Building sandbox image");

        let mut log = String::new();
        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(SandboxError::Build {
                            message: error,
                            log: tail_lines(&log, BUILD_LOG_TAIL_LINES),
                        });
                    }
                    if let Some(line) = info.stream {
                        debug!(image, "{}", line.trim_end());
                        log.push_str(&line);
                    }
                }
                Err(e) => {
                    return Err(SandboxError::Build {
                        message: e.to_string(),
                        log: tail_lines(&log, BUILD_LOG_TAIL_LINES),
                    });
                }
            }
        }

        info!(image, "Sandbox image built");
        Ok(())
    }

    async fn run(&self, image: &str, command: &[String]) -> Result<ExecutionOutcome, SandboxError> {
        let container = container_name(image);

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(command.to_vec()),
            working_dir: Some("/app".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                memory: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::Run {
                message: format!("failed to create container: {}", e),
                stderr: String::new(),
            })?;

        debug!(image, container = %container, "Container created");

        let outcome = self.drive(&container).await;
        self.remove_container(&container).await;

        if let Ok(outcome) = &outcome {
            info!(image, container = %container, exit_code = outcome.exit_code, "Sandbox run finished");
        }
        outcome
    }

    async fn destroy_image(&self, image: &str) {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => info!(image, "Sandbox image removed"),
            Err(e) => warn!(image, error = %e, "Failed to remove sandbox image"),
        }
    }
}

/// Tar the workspace into a build context, leaving out VCS metadata
fn package_context(root: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""))?;
    builder.into_inner()
}

fn append_tree(
    builder: &mut tar::Builder<Vec<u8>>,
    dir: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    // Sorted so identical workspaces yield the same entry order
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }

        let path = entry.path();
        let relative = prefix.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&relative, &path)?;
            append_tree(builder, &path, &relative)?;
        } else {
            builder.append_path_with_name(&path, &relative)?;
        }
    }

    Ok(())
}

fn tail_lines(text: &str, keep: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(keep);
    lines[start..].join("\n")
}
