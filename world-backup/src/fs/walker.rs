//! Depth-first directory traversal for archiving.
//!
//! Symlinks are followed. Every path is resolved to its canonical form before
//! it is compared against the ignore set and the visited set, so a directory
//! reachable twice (through a symlink, or as a dataset and again as part of
//! the server root) is only emitted once, and cycles terminate.

use crate::fs::ignore::{canonical, IgnoreSet};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Canonical paths already written during one backup run
#[derive(Debug, Default)]
pub struct VisitedSet {
    paths: HashSet<PathBuf>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, canonical_path: &Path) -> bool {
        self.paths.contains(canonical_path)
    }

    pub fn insert(&mut self, canonical_path: PathBuf) -> bool {
        self.paths.insert(canonical_path)
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A file or directory selected for the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path as reached from the walk root
    pub path: PathBuf,

    /// Normalized name inside the archive (no trailing separator)
    pub archive_name: String,

    pub is_dir: bool,
}

/// Something the walk produced
#[derive(Debug)]
pub enum WalkItem {
    Entry(WalkEntry),

    /// A path that could not be inspected; the walk continues past it
    Unreadable { path: PathBuf, reason: String },
}

/// Normalize a name for use inside the archive: strip one leading separator,
/// a leading `./` and a trailing `/.`. Backslashes count as separators.
pub fn normalize_archive_name(name: &str) -> String {
    let mut name = name;
    if let Some(rest) = name.strip_prefix('/').or_else(|| name.strip_prefix('\\')) {
        name = rest;
    }
    if let Some(rest) = name.strip_prefix("./").or_else(|| name.strip_prefix(".\\")) {
        name = rest;
    }
    if let Some(rest) = name.strip_suffix("/.").or_else(|| name.strip_suffix("\\.")) {
        name = rest;
    }
    name.replace('\\', "/")
}

fn join_archive_name(base: &str, relative: &Path) -> String {
    let rel = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    if base.is_empty() {
        normalize_archive_name(&rel)
    } else if rel.is_empty() {
        base.to_string()
    } else {
        normalize_archive_name(&format!("{}/{}", base, rel))
    }
}

/// Walk `root` depth-first in directory-listing order.
///
/// A path is skipped (with its whole subtree) when its canonical form is in
/// `visited` or in `ignore`; otherwise it is recorded in `visited` and handed
/// to `callback`. Errors returned by the callback stop the walk.
pub fn walk_tree<F, E>(
    root: &Path,
    archive_name: &str,
    ignore: &IgnoreSet,
    visited: &mut VisitedSet,
    mut callback: F,
) -> Result<(), E>
where
    F: FnMut(WalkItem) -> Result<(), E>,
{
    let base = normalize_archive_name(archive_name);

    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            let resolved = canonical(entry.path());
            if visited.contains(&resolved) {
                debug!("Already visited {}", entry.path().display());
                return false;
            }
            if ignore.contains_canonical(&resolved) {
                debug!("Ignoring {}", entry.path().display());
                return false;
            }
            visited.insert(resolved);
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.loop_ancestor().is_some() {
                    debug!("Symlink loop: {}", e);
                    continue;
                }
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                callback(WalkItem::Unreadable {
                    path,
                    reason: e.to_string(),
                })?;
                continue;
            }
        };

        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            debug!("Skipping special file {}", entry.path().display());
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        callback(WalkItem::Entry(WalkEntry {
            path: entry.path().to_path_buf(),
            archive_name: join_archive_name(&base, relative),
            is_dir: file_type.is_dir(),
        }))?;
    }

    Ok(())
}
