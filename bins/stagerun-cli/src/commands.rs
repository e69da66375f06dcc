// CLI commands for driving a stagerun deployment
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use stagerun_common::redis as queue;
use stagerun_common::types::{JobRequest, Language, LogMessage};

async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Push a job request onto the request queue
pub async fn submit_job(
    redis_url: &str,
    queue_name: Option<&str>,
    repo_url: &str,
    branch: &str,
    commit_sha: &str,
) -> Result<()> {
    if repo_url.trim().is_empty() || commit_sha.trim().is_empty() {
        bail!("Repository URL and commit sha cannot be empty");
    }

    let queue_name = queue_name
        .map(str::to_string)
        .unwrap_or_else(queue::job_queue);
    let job = JobRequest {
        event_type: Some("push".to_string()),
        ..JobRequest::new(repo_url, branch, commit_sha)
    };

    let mut conn = connect(redis_url).await?;
    queue::push_job(&mut conn, &queue_name, &job)
        .await
        .context("Failed to queue job")?;

    println!("✓ Job {} queued on {}", commit_sha, queue_name);
    println!("  Follow it with: stagerun-cli logs {}", commit_sha);
    Ok(())
}

/// Attach to a job's live stream and print each message until the job ends
pub async fn follow_logs(server: &str, commit_sha: &str) -> Result<()> {
    let url = format!("{}/logs/{}", server.trim_end_matches('/'), commit_sha);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    match response.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::CONFLICT => {
            bail!("Another viewer is already following job {}", commit_sha)
        }
        status => bail!("Worker answered {} for {}", status, url),
    }

    let mut parser = EventParser::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Log stream interrupted")?;
        for message in parser.feed(&chunk) {
            println!("{}", message.message);
        }
    }

    Ok(())
}

/// Print the most recent results, newest first
pub async fn show_results(redis_url: &str, queue_name: Option<&str>, limit: usize) -> Result<()> {
    let queue_name = queue_name
        .map(str::to_string)
        .unwrap_or_else(queue::result_queue);

    let mut conn = connect(redis_url).await?;
    let results = queue::recent_results(&mut conn, &queue_name, limit)
        .await
        .context("Failed to read results")?;

    if results.is_empty() {
        println!("No results on {}", queue_name);
        return Ok(());
    }

    for reported in results {
        let status = if reported.result.success { "PASS" } else { "FAIL" };
        println!("{}  {}", status, reported.commit_sha);
        if let Some(error) = &reported.result.error_message {
            println!("  error: {}", error);
        }
        for line in reported.result.output.lines().take(5) {
            println!("  | {}", line);
        }
    }

    Ok(())
}

/// Print every supported language and its sandbox profile
pub fn list_languages() {
    println!("{:<12} {:<18} {:<24} STAGE COMMAND", "LANGUAGE", "BASE IMAGE", "FIXTURE PATH");
    for language in Language::all_variants() {
        println!(
            "{:<12} {:<18} {:<24} {}",
            language.to_string(),
            language.base_image(),
            language.fixture_path(1),
            language.run_command(1, true),
        );
    }
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
/// Bytes are buffered until a full line arrives, so a character split
/// across network chunks is decoded whole.
#[derive(Debug, Default)]
struct EventParser {
    buffer: Vec<u8>,
}

impl EventParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<LogMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                match serde_json::from_str::<LogMessage>(data) {
                    Ok(message) => messages.push(message),
                    Err(_) => messages.push(LogMessage::new(data)),
                }
            }
        }
        messages
    }
}
