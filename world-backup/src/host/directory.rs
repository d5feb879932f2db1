//! A host whose datasets are plain directories.
//!
//! Used by the standalone daemon: "flushing" a dataset fsyncs every file under
//! it, and the privileged context is a dedicated thread draining a queue.

use super::{Dataset, Host, Task};
use crate::config::ServerConfig;
use std::fs::File;
use std::io::ErrorKind;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Single thread that runs queued tasks in submission order
pub struct MainThread {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MainThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Main thread started");
                while let Some(task) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("Task on main thread panicked");
                    }
                }
                debug!("Main thread terminated");
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a task; dropped with a warning after [`MainThread::shutdown`].
    pub fn execute(&self, task: Task) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    warn!("Main thread has exited, task dropped");
                }
            }
            None => warn!("Main thread is shut down, task dropped"),
        }
    }

    /// Stop accepting tasks, finish the queued ones and join the thread
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Main thread panicked during shutdown");
            }
        }
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A directory exposed as a dataset
#[derive(Debug)]
pub struct DirectoryDataset {
    name: String,
    root: PathBuf,
    auto_flush: AtomicBool,
}

impl DirectoryDataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        Self {
            name,
            root,
            auto_flush: AtomicBool::new(true),
        }
    }

    pub fn auto_flush(&self) -> bool {
        self.auto_flush.load(Ordering::SeqCst)
    }
}

impl Dataset for DirectoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    fn flush(&self) -> std::io::Result<()> {
        let mut synced = 0usize;
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                // Removed by the host between listing and visiting
                Err(e)
                    if e.depth() > 0
                        && e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) =>
                {
                    debug!(dataset = %self.name, "Skipping vanished entry: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if entry.file_type().is_file() && sync_file(entry.path())? {
                synced += 1;
            }
        }
        debug!(dataset = %self.name, synced, "Dataset flushed");
        Ok(())
    }

    fn set_auto_flush(&self, enabled: bool) {
        self.auto_flush.store(enabled, Ordering::SeqCst);
    }
}

/// fsync one file; false if it no longer exists
fn sync_file(path: &Path) -> std::io::Result<bool> {
    match File::open(path).and_then(|file| file.sync_all()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} vanished before it could be flushed", path.display());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Host backed by configured dataset directories
pub struct DirectoryHost {
    enabled: AtomicBool,
    datasets: Vec<Arc<DirectoryDataset>>,
    main: MainThread,
}

impl DirectoryHost {
    pub fn new(datasets: Vec<PathBuf>) -> std::io::Result<Self> {
        Ok(Self {
            enabled: AtomicBool::new(true),
            datasets: datasets
                .into_iter()
                .map(|p| Arc::new(DirectoryDataset::new(p)))
                .collect(),
            main: MainThread::spawn("host-main")?,
        })
    }

    /// Datasets from `server.datasets`, resolved against `server.root`
    pub fn from_config(server: &ServerConfig) -> std::io::Result<Self> {
        let paths = server.datasets.iter().map(|p| server.root.join(p)).collect();
        Self::new(paths)
    }

    /// Refuse further backups, e.g. during shutdown
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn directory_datasets(&self) -> &[Arc<DirectoryDataset>] {
        &self.datasets
    }

    pub fn shutdown(&self) {
        self.disable();
        self.main.shutdown();
    }
}

impl Host for DirectoryHost {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn datasets(&self) -> Vec<Arc<dyn Dataset>> {
        self.datasets
            .iter()
            .map(|d| d.clone() as Arc<dyn Dataset>)
            .collect()
    }

    fn broadcast(&self, message: &str) {
        info!(target: "broadcast", "{}", message);
    }

    fn execute(&self, task: Task) {
        self.main.execute(task);
    }
}
