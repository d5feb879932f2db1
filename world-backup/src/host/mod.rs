//! Interface to the server that owns the live datasets.
//!
//! The backup pipeline only needs to enumerate datasets, flush them on the
//! host's privileged thread, pause their background auto-flush while they are
//! archived, and announce progress.

pub mod directory;

use std::path::Path;
use std::sync::Arc;

/// Work submitted to the host's privileged execution context
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A unit of live, mutable server state (e.g. a world)
pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    fn root_path(&self) -> &Path;

    /// Write all pending state to disk. Only called from [`Host::execute`].
    fn flush(&self) -> std::io::Result<()>;

    fn set_auto_flush(&self, enabled: bool);
}

pub trait Host: Send + Sync {
    /// False once the host is shutting down; backups are refused then.
    fn is_enabled(&self) -> bool;

    fn datasets(&self) -> Vec<Arc<dyn Dataset>>;

    /// Announce a message to everyone connected to the host
    fn broadcast(&self, message: &str);

    /// Queue `task` on the privileged execution context
    fn execute(&self, task: Task);
}
