mod consumer;
mod detect;
mod error;
mod fixtures;
mod git;
mod log_hub;
mod metrics;
mod orchestrator;
mod progress;
mod reporter;
mod sandbox;
mod scaffold;
mod server;
mod workspace;

use anyhow::Context;
use consumer::{RedisJobQueue, WorkerPool};
use fixtures::{FixtureRepository, FixtureSource};
use log_hub::LogHub;
use orchestrator::{Collaborators, JobOrchestrator, OrchestratorSettings};
use progress::HttpProgressProvider;
use redis::aio::ConnectionManager;
use reporter::RedisResultReporter;
use sandbox::{DockerSandbox, SandboxLimits};
use stagerun_common::config::{Config, LogFormat};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use workspace::GitWorkspaces;

/// How long open viewer streams may hold up shutdown once the pool is idle
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    init_tracing(config.log_format);

    info!("Stagerun worker booting...");

    metrics::init_metrics().context("Failed to initialize metrics registry")?;

    // Connect to Redis
    let client = redis::Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, worker_id = %config.worker_id, "Connected to Redis");

    let sandbox = DockerSandbox::connect(config.sandbox_run_timeout())
        .await
        .context("Failed to connect to Docker")?
        .with_limits(SandboxLimits {
            memory_bytes: (config.sandbox_memory_mb * 1024 * 1024) as i64,
            nano_cpus: (config.sandbox_cpus * 1_000_000_000.0) as i64,
        });

    let fixture_source = match &config.fixture_repo_url {
        Some(url) => FixtureSource::Git {
            url: url.clone(),
            branch: config.fixture_repo_branch.clone(),
        },
        None => FixtureSource::Local,
    };
    let fixtures = FixtureRepository::new(
        fixture_source,
        &config.fixture_cache_dir,
        &config.fixture_tests_path,
    );
    if let Err(e) = fixtures.force_refresh().await {
        warn!(error = %format!("{:#}", e), "Fixture repository not ready, will retry per job");
    }

    let hub = LogHub::new();
    let collaborators = Collaborators {
        progress: Arc::new(HttpProgressProvider::new(&config.progress_service_url)?),
        reporter: Arc::new(RedisResultReporter::new(
            redis_conn.clone(),
            &config.result_queue,
        )),
        workspaces: Arc::new(GitWorkspaces::new(&config.workspace_root)),
        fixtures: Arc::new(fixtures),
        sandbox: Arc::new(sandbox),
        hub: hub.clone(),
    };
    let orchestrator = Arc::new(JobOrchestrator::new(
        collaborators,
        OrchestratorSettings {
            viewer_attach_timeout: config.viewer_attach_timeout(),
        },
    ));

    let (stop, shutdown) = watch::channel(false);

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let mut server = tokio::spawn(server::serve(
        listener,
        server::AppState::new(hub),
        shutdown.clone(),
    ));

    let pool = WorkerPool::new(
        Arc::new(RedisJobQueue::new(
            redis_conn,
            &config.job_queue,
            &config.worker_id,
        )),
        orchestrator,
        config.max_concurrent_jobs,
    );
    let mut workers = tokio::spawn(async move { pool.run(shutdown).await });

    info!(queue = %config.job_queue, "Listening for jobs");

    tokio::select! {
        _ = shutdown_signal() => info!("Received shutdown signal, draining jobs..."),
        _ = &mut workers => warn!("Worker pool exited unexpectedly"),
    }
    let _ = stop.send(true);

    if !workers.is_finished() {
        if let Err(e) = (&mut workers).await {
            warn!(error = %e, "Worker pool task failed");
        }
    }

    match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %format!("{:#}", e), "HTTP server error"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => {
            warn!("Viewer streams still open, stopping HTTP server");
            server.abort();
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
