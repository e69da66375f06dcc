mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stagerun-cli")]
#[command(about = "Stagerun CLI - Submit jobs, follow live logs and inspect results", long_about = None)]
struct Cli {
    /// Redis connection URL
    #[arg(long, global = true, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a job for a pushed revision
    Submit {
        /// Learner repository URL
        #[arg(short, long)]
        repo_url: String,

        /// Branch the revision was pushed to
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Revision to test; also the job id
        #[arg(short, long)]
        commit_sha: String,

        /// Request queue (defaults to stagerun:queue:jobs)
        #[arg(short, long, env = "JOB_QUEUE")]
        queue: Option<String>,
    },

    /// Follow the live log stream of a job
    Logs {
        /// Job id (commit sha)
        commit_sha: String,

        /// Worker HTTP address
        #[arg(short, long, env = "STAGERUN_SERVER", default_value = "http://127.0.0.1:3000")]
        server: String,
    },

    /// Show the most recent reported results
    Results {
        /// Number of results to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Result queue (defaults to stagerun:queue:results)
        #[arg(short, long, env = "RESULT_QUEUE")]
        queue: Option<String>,
    },

    /// List supported languages and their sandbox profiles
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            repo_url,
            branch,
            commit_sha,
            queue,
        } => {
            commands::submit_job(&cli.redis_url, queue.as_deref(), &repo_url, &branch, &commit_sha)
                .await?;
        }
        Commands::Logs { commit_sha, server } => {
            commands::follow_logs(&server, &commit_sha).await?;
        }
        Commands::Results { limit, queue } => {
            commands::show_results(&cli.redis_url, queue.as_deref(), limit).await?;
        }
        Commands::Languages => {
            commands::list_languages();
        }
    }

    Ok(())
}
