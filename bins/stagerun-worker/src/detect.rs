// Language detection for a checked-out workspace

use stagerun_common::types::Language;
use std::path::Path;

/// Guess the workspace language from its build files.
/// Checked in order: Rust, TypeScript, Python.
pub fn detect_language(workspace: &Path) -> Option<Language> {
    if workspace.join("Cargo.toml").is_file() {
        return Some(Language::Rust);
    }
    if workspace.join("package.json").is_file() {
        return Some(Language::TypeScript);
    }
    if workspace.join("pyproject.toml").is_file()
        || workspace.join("requirements.txt").is_file()
        || has_python_sources(&workspace.join("app"))
    {
        return Some(Language::Python);
    }
    None
}

fn has_python_sources(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| entry.path().extension().is_some_and(|ext| ext == "py"))
        })
        .unwrap_or(false)
}
