// Generated files written into a workspace before the sandbox build

use stagerun_common::types::{Language, METADATA_DIR};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RUN_SCRIPT: &str = "run.sh";
pub const DOCKERFILE: &str = "Dockerfile";

/// Command the sandbox executes for every stage
pub fn sandbox_command() -> Vec<String> {
    vec!["bash".to_string(), format!("{}/{}", METADATA_DIR, RUN_SCRIPT)]
}

/// Shell script that runs one stage and stops at the first failing step
pub fn run_script(language: Language, stage: u32, has_fixture: bool) -> String {
    format!(
        "#!/bin/bash\nset -e\n\n{}\n",
        language.run_command(stage, has_fixture)
    )
}

/// What `prepare` wrote, relative to the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scaffold {
    pub fixture: Option<PathBuf>,
    pub run_script: PathBuf,
    pub dockerfile: PathBuf,
}

/// Write the stage fixture, the run script and the build descriptor
pub async fn prepare(
    workspace: &Path,
    language: Language,
    stage: u32,
    fixture: Option<&str>,
) -> io::Result<Scaffold> {
    let metadata = workspace.join(METADATA_DIR);
    tokio::fs::create_dir_all(&metadata).await?;

    let fixture_path = match fixture {
        Some(content) => {
            let relative = PathBuf::from(language.fixture_path(stage));
            let target = workspace.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
            debug!(fixture = %target.display(), "Stage fixture written");
            Some(relative)
        }
        None => None,
    };

    let script = metadata.join(RUN_SCRIPT);
    tokio::fs::write(&script, run_script(language, stage, fixture.is_some())).await?;
    set_executable(&script).await?;

    tokio::fs::write(metadata.join(DOCKERFILE), language.dockerfile()).await?;

    Ok(Scaffold {
        fixture: fixture_path,
        run_script: Path::new(METADATA_DIR).join(RUN_SCRIPT),
        dockerfile: Path::new(METADATA_DIR).join(DOCKERFILE),
    })
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
