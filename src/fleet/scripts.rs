//! Script list: one local script path per line.
//!
//! Blank lines and lines starting with `#` are ignored.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ScriptListError;
use super::types::ScriptJob;

pub async fn load(path: &Path) -> Result<Vec<PathBuf>, ScriptListError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ScriptListError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let scripts = parse(&text);
    debug!("Loaded {} script(s) from {}", scripts.len(), path.display());
    Ok(scripts)
}

pub fn parse(text: &str) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

/// Turn script paths into jobs indexed by list position.
pub fn jobs(scripts: &[PathBuf], remote_dir: &str) -> Vec<ScriptJob> {
    scripts
        .iter()
        .enumerate()
        .map(|(index, path)| ScriptJob::new(index, path.clone(), remote_dir))
        .collect()
}
