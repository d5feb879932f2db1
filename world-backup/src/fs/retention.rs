//! Retention policy for finished archives.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

pub const ARCHIVE_SUFFIX: &str = "zip";

/// What a pruning pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Delete the oldest archives in `directory` so that, once the next archive
/// is written, at most `max_backups` remain. `max_backups <= 0` keeps everything.
///
/// Age is the last-modified time; ties are broken by path. Deletion failures
/// are logged and pruning moves on to the next candidate.
pub fn prune(directory: &Path, max_backups: i64) -> std::io::Result<PruneReport> {
    if max_backups <= 0 {
        return Ok(PruneReport::default());
    }

    let mut archives = list_archives(directory)?;
    archives.sort();

    let keep = (max_backups - 1) as usize;
    let excess = archives.len().saturating_sub(keep);

    let mut report = PruneReport {
        kept: archives.len() - excess,
        ..Default::default()
    };

    for (_, path) in archives.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed old backup: {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                warn!("Unable to delete old backup {}: {}", path.display(), e);
                report.failed.push(path);
            }
        }
    }

    Ok(report)
}

/// Archives in `directory` as (modified, path) pairs, unsorted
fn list_archives(directory: &Path) -> std::io::Result<Vec<(SystemTime, PathBuf)>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_archive = path
            .extension()
            .map(|ext| ext == ARCHIVE_SUFFIX)
            .unwrap_or(false);
        if !is_archive {
            continue;
        }

        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        archives.push((modified, path));
    }

    Ok(archives)
}
