// Thin async wrapper around the git CLI

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;

/// Run git with `args`, returning stdout. Non-zero exit becomes an error
/// carrying git's stderr.
pub async fn run<I, S>(args: I, cwd: Option<&Path>) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new("git");
    command.args(args).env("GIT_TERMINAL_PROMPT", "0").kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output().await.context("Failed to spawn git")?;
    if !output.status.success() {
        bail!(
            "git exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
