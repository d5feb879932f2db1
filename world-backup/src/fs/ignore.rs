//! Path exclusion shared between the orchestrator and the archive writer.

use dashmap::DashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Resolve symlinks and relative segments.
///
/// A path that does not exist yet is resolved through its nearest existing
/// ancestor, so it compares equal to the canonical form it gets once created.
pub fn canonical(path: &Path) -> PathBuf {
    if let Ok(p) = std::fs::canonicalize(path) {
        return p;
    }

    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    for ancestor in absolute.ancestors().skip(1) {
        let Ok(mut resolved) = std::fs::canonicalize(ancestor) else {
            continue;
        };
        let Ok(rest) = absolute.strip_prefix(ancestor) else {
            continue;
        };
        for component in rest.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => resolved.push(name),
                _ => {}
            }
        }
        return resolved;
    }
    absolute
}

/// Set of excluded paths, compared by canonical form
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    paths: Arc<DashSet<PathBuf>>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of permanent ignores
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let set = Self::new();
        for p in paths {
            set.insert(p.as_ref());
        }
        set
    }

    /// Returns true if the path was not already present
    pub fn insert(&self, path: &Path) -> bool {
        self.paths.insert(canonical(path))
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.paths.remove(&canonical(path)).is_some()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(&canonical(path))
    }

    /// Membership test for a path that is already canonical
    pub fn contains_canonical(&self, canonical_path: &Path) -> bool {
        self.paths.contains(canonical_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Start a scope whose additions are undone when it drops
    pub fn scope(&self) -> TempIgnore<'_> {
        TempIgnore {
            set: self,
            added: Vec::new(),
        }
    }
}

/// Entries added for the duration of one backup run.
///
/// Only paths this scope inserted are removed on drop; entries that were
/// already present stay untouched.
pub struct TempIgnore<'a> {
    set: &'a IgnoreSet,
    added: Vec<PathBuf>,
}

impl TempIgnore<'_> {
    pub fn add(&mut self, path: &Path) {
        let canonical_path = canonical(path);
        if self.set.paths.insert(canonical_path.clone()) {
            debug!("Temporarily ignoring {}", canonical_path.display());
            self.added.push(canonical_path);
        }
    }

    pub fn added(&self) -> &[PathBuf] {
        &self.added
    }
}

impl Drop for TempIgnore<'_> {
    fn drop(&mut self) {
        for p in self.added.drain(..) {
            self.set.paths.remove(&p);
        }
    }
}
