//! Socket path discovery
//!
//! Applications that create a fresh socket per launch leave several files
//! behind in their runtime directory. The transport never guesses; callers
//! use these helpers to pick a path and pass it in.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::TransportConfig;

/// Default extension of socket files
pub const SOCKET_EXTENSION: &str = "sock";

/// Find the most recently modified file in `dir` with the given extension
pub fn find_newest_socket(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        debug!("Socket directory does not exist: {}", dir.display());
        return Ok(None);
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read socket directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|s| s.to_str()) != Some(extension) {
            continue;
        }

        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        debug!("Found candidate socket: {}", path.display());
        match &newest {
            Some((best, _)) if *best >= modified => {}
            _ => newest = Some((modified, path)),
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Explicitly configured path first, then the newest socket in `dir`
pub fn resolve_socket_path(config: &TransportConfig, dir: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = &config.socket_path {
        return Ok(Some(path.clone()));
    }
    find_newest_socket(dir, SOCKET_EXTENSION)
}
