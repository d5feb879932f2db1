//! Backup orchestrator - Runs one backup from lock to completion notice.
//!
//! A run flushes and archives every host dataset, then the rest of the server
//! root, into a single zip, prunes old archives and optionally hands the new
//! archive to the [`Uploader`]. Archiving happens on the blocking pool; only
//! dataset flushes are marshalled onto the host's privileged context.

pub mod lock;

use crate::archive::{write_tree, ArchiveSink, ArchiveSummary};
use crate::config::{BackupConfig, Config, DATE_TOKEN};
use crate::fs::ignore::{canonical, IgnoreSet, TempIgnore};
use crate::fs::retention::{self, ARCHIVE_SUFFIX};
use crate::fs::walker::{normalize_archive_name, VisitedSet};
use crate::host::{Dataset, Host};
use crate::transfer::progress::{format_bytes, format_duration};
use crate::transfer::{UploadOutcome, Uploader};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local};
use lock::OperationLock;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a backup request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    HostDisabled,
    BackupInProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostDisabled => f.write_str("Unable to start a backup, the host is disabled!"),
            Self::BackupInProgress => {
                f.write_str("A backup was requested, but a backup is already in progress. Skipping...")
            }
        }
    }
}

#[derive(Debug)]
pub enum BackupOutcome {
    Completed {
        path: PathBuf,
        summary: ArchiveSummary,
        /// Present when the archive was handed to the uploader
        upload: Option<JoinHandle<UploadOutcome>>,
    },
    Skipped(SkipReason),
    Failed(String),
}

pub struct BackupManager {
    host: Arc<dyn Host>,
    config: Arc<Config>,
    lock: OperationLock,
    ignore: IgnoreSet,
    uploader: Arc<Uploader>,
}

impl BackupManager {
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let uploader = Arc::new(Uploader::new(config.upload.clone()));
        Self::with_uploader(host, config, uploader)
    }

    pub fn with_uploader(host: Arc<dyn Host>, config: Config, uploader: Arc<Uploader>) -> Self {
        let ignore = IgnoreSet::from_paths(config.backup.ignore.iter().map(|p| config.resolve(p)));
        if !ignore.is_empty() {
            info!("Ignoring {} configured path(s) in backups", ignore.len());
        }

        Self {
            host,
            config: Arc::new(config),
            lock: OperationLock::new(),
            ignore,
            uploader,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    /// Run one backup and report what happened. Never panics or errors out;
    /// failures come back as [`BackupOutcome::Failed`].
    pub async fn run_backup(&self, upload_requested: bool, scheduled: bool) -> BackupOutcome {
        if scheduled {
            self.host.broadcast("Starting scheduled backup...");
        } else {
            info!("Starting backup...");
        }

        if !self.host.is_enabled() {
            return self.skip(SkipReason::HostDisabled, scheduled);
        }
        let Some(guard) = self.lock.try_acquire() else {
            return self.skip(SkipReason::BackupInProgress, scheduled);
        };

        let started = Instant::now();
        let host = Arc::clone(&self.host);
        let config = Arc::clone(&self.config);
        let ignore = self.ignore.clone();

        let result = tokio::task::spawn_blocking(move || {
            write_backup(host.as_ref(), &config, &ignore, Local::now())
        })
        .await
        .unwrap_or_else(|e| Err(BackupError::Worker(e.to_string())));

        let outcome = match result {
            Ok((path, summary)) => {
                info!(
                    files = summary.files,
                    directories = summary.directories,
                    skipped = summary.skipped.len(),
                    "Wrote {} ({} in {})",
                    path.display(),
                    format_bytes(summary.bytes),
                    format_duration(started.elapsed())
                );

                let upload = if upload_requested && self.uploader.is_enabled() {
                    self.uploader.upload(path.clone(), false)
                } else {
                    None
                };

                if scheduled {
                    self.host.broadcast("Scheduled backup complete!");
                } else {
                    info!("Local backup complete!");
                }
                BackupOutcome::Completed {
                    path,
                    summary,
                    upload,
                }
            }
            Err(e) => {
                error!(error = ?e, "Backup failed: {}", e);
                if scheduled {
                    self.host.broadcast("Scheduled backup failed, check the server log.");
                }
                BackupOutcome::Failed(e.to_string())
            }
        };

        drop(guard);
        outcome
    }

    /// Start a backup in the background
    pub fn trigger_backup(self: &Arc<Self>, upload_requested: bool, scheduled: bool) -> JoinHandle<BackupOutcome> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_backup(upload_requested, scheduled).await })
    }

    /// Wait for a running backup to release its lock. Returns false on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        true
    }

    fn skip(&self, reason: SkipReason, scheduled: bool) -> BackupOutcome {
        if scheduled {
            self.host.broadcast(&reason.to_string());
        } else {
            warn!("{}", reason);
        }
        BackupOutcome::Skipped(reason)
    }
}

/// Re-enables auto-flush on every dataset when dropped
struct AutoFlushRestore {
    datasets: Vec<Arc<dyn Dataset>>,
}

impl Drop for AutoFlushRestore {
    fn drop(&mut self) {
        for dataset in &self.datasets {
            dataset.set_auto_flush(true);
        }
    }
}

/// Archive file name (without directory) for a run started at `now`
pub fn archive_file_name(backup: &BackupConfig, now: DateTime<Local>) -> Result<String> {
    let mut date = String::new();
    write!(date, "{}", now.format(&backup.date_format))
        .map_err(|_| BackupError::DateFormat(backup.date_format.clone()))?;

    Ok(format!(
        "{}.{}",
        backup.filename_template.replace(DATE_TOKEN, &date),
        ARCHIVE_SUFFIX
    ))
}

/// The blocking part of a run: everything between taking the lock and the
/// upload hand-off.
fn write_backup(
    host: &dyn Host,
    config: &Config,
    ignore: &IgnoreSet,
    now: DateTime<Local>,
) -> Result<(PathBuf, ArchiveSummary)> {
    let datasets = host.datasets();
    let _restore = AutoFlushRestore {
        datasets: datasets.clone(),
    };
    let mut temp_ignore = ignore.scope();

    ignore_plugin_files(config, &mut temp_ignore);

    let backup_dir = config.backup_dir();
    std::fs::create_dir_all(&backup_dir).map_err(|source| BackupError::Io {
        path: backup_dir.clone(),
        source,
    })?;
    temp_ignore.add(&backup_dir);

    let pruned = retention::prune(&backup_dir, config.backup.max_backups).map_err(|source| {
        BackupError::Io {
            path: backup_dir.clone(),
            source,
        }
    })?;
    debug!(kept = pruned.kept, deleted = pruned.deleted.len(), "Retention applied");

    let path = backup_dir.join(archive_file_name(&config.backup, now)?);
    let mut sink = ArchiveSink::create(&path, config.backup.compression_level)?;

    let result = archive_contents(host, config, ignore, &mut temp_ignore, &datasets, &mut sink)
        .and_then(|summary| {
            sink.close(&path)?;
            Ok(summary)
        });

    match result {
        Ok(summary) => Ok((path, summary)),
        Err(e) => {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                warn!("Unable to remove incomplete archive {}: {}", path.display(), remove_err);
            }
            Err(e)
        }
    }
}

fn archive_contents<W: std::io::Write + std::io::Seek>(
    host: &dyn Host,
    config: &Config,
    ignore: &IgnoreSet,
    temp_ignore: &mut TempIgnore<'_>,
    datasets: &[Arc<dyn Dataset>],
    sink: &mut ArchiveSink<W>,
) -> Result<ArchiveSummary> {
    let root = canonical(&config.server.root);
    let mut visited = VisitedSet::new();
    let mut summary = ArchiveSummary::default();

    for dataset in datasets {
        let folder = dataset.root_path();
        if ignore.contains(folder) {
            debug!("Dataset {} is ignored", dataset.name());
            continue;
        }
        let archive_name = dataset_archive_name(&root, dataset.as_ref());

        flush_on_host(host, dataset)?;
        dataset.set_auto_flush(false);

        info!("Backing up dataset {} {}...", dataset.name(), archive_name);
        let written = write_tree(folder, &archive_name, sink, ignore, &mut visited);
        dataset.set_auto_flush(true);
        summary.merge(written?);

        temp_ignore.add(folder);
    }

    info!("Backing up other files...");
    summary.merge(write_tree(&config.server.root, "", sink, ignore, &mut visited)?);

    Ok(summary)
}

/// Plugin binaries and plugin config folders excluded by configuration
fn ignore_plugin_files(config: &Config, temp_ignore: &mut TempIgnore<'_>) {
    let plugin_dir = config.plugin_dir();
    let entries = match std::fs::read_dir(&plugin_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No plugin directory at {}: {}", plugin_dir.display(), e);
            return;
        }
    };

    let suffix = config.server.plugin_binary_suffix.as_str();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_binary = path.extension().map(|ext| ext == suffix).unwrap_or(false);
        if (!config.backup.backup_plugin_binaries && is_binary)
            || (!config.backup.backup_plugin_configs && path.is_dir())
        {
            temp_ignore.add(&path);
        }
    }
}

/// Dataset location relative to the server root; datasets outside the root
/// are stored under their name.
fn dataset_archive_name(root: &Path, dataset: &dyn Dataset) -> String {
    let folder = canonical(dataset.root_path());
    match folder.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            let joined = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            normalize_archive_name(&joined)
        }
        _ => normalize_archive_name(dataset.name()),
    }
}

/// Run `flush` on the host's privileged context and block until it reports back
fn flush_on_host(host: &dyn Host, dataset: &Arc<dyn Dataset>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let target = Arc::clone(dataset);
    host.execute(Box::new(move || {
        // The receiver only disappears if the backup worker died
        let _ = tx.send(target.flush());
    }));

    match rx.blocking_recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BackupError::Flush(dataset.name().to_string(), e)),
        Err(_) => Err(BackupError::FlushAbandoned(dataset.name().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::directory::DirectoryHost;
    use crate::host::Task;
    use crate::transfer::{Connector, RemoteTransport, TransportKind};
    use crate::config::UploadConfig;
    use crate::utils::errors::UploadError;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use std::fs::{self, File, FileTimes};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn server_tree() -> std::io::Result<TempDir> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("worldA/region"))?;
        fs::write(root.join("worldA/level.dat"), b"level")?;
        fs::write(root.join("worldA/region/r.0.0.mca"), vec![3u8; 4096])?;
        fs::create_dir_all(root.join("plugins/Essentials"))?;
        fs::write(root.join("plugins/other.jar"), b"jar")?;
        fs::write(root.join("plugins/Essentials/config.yml"), b"a: 1")?;
        fs::write(root.join("server.properties"), b"motd=hi")?;
        Ok(temp_dir)
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.server.root = root.to_path_buf();
        config.server.datasets = vec![PathBuf::from("worldA")];
        config
    }

    fn directory_manager(config: Config) -> (Arc<DirectoryHost>, BackupManager) {
        let host = Arc::new(DirectoryHost::from_config(&config.server).unwrap());
        let manager = BackupManager::new(host.clone(), config);
        (host, manager)
    }

    fn entry_names(path: &Path) -> BTreeSet<String> {
        let zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        zip.file_names().map(str::to_string).collect()
    }

    fn archives_in(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "zip").unwrap_or(false))
            .collect();
        found.sort();
        found
    }

    #[test]
    fn test_archive_file_name() {
        let backup = BackupConfig::default();
        let now = Local.with_ymd_and_hms(2024, 5, 1, 3, 0, 9).unwrap();
        assert_eq!(
            archive_file_name(&backup, now).unwrap(),
            "backup-2024-05-01-03-00-09.zip"
        );

        let backup = BackupConfig {
            date_format: "%Q".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            archive_file_name(&backup, now),
            Err(BackupError::DateFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_archive_contents() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let (host, manager) = directory_manager(test_config(temp_dir.path()));

        let BackupOutcome::Completed { path, summary, upload } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };
        assert!(upload.is_none());
        assert!(path.starts_with(temp_dir.path().join("backups")));

        let names = entry_names(&path);
        for expected in [
            "worldA/",
            "worldA/level.dat",
            "worldA/region/r.0.0.mca",
            "plugins/",
            "plugins/Essentials/config.yml",
            "server.properties",
        ] {
            assert!(names.contains(expected), "missing {}", expected);
        }
        assert!(!names.contains("plugins/other.jar"));
        assert!(names.iter().all(|n| !n.starts_with("backups")));
        assert!(summary.skipped.is_empty());

        // Transient ignores and the lock are gone, auto-flush is back on
        assert!(manager.ignore().is_empty());
        assert!(!manager.is_running());
        assert!(host.directory_datasets()[0].auto_flush());
        Ok(())
    }

    #[tokio::test]
    async fn test_plugin_configs_excluded_when_disabled() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let mut config = test_config(temp_dir.path());
        config.backup.backup_plugin_binaries = true;
        config.backup.backup_plugin_configs = false;
        let (_host, manager) = directory_manager(config);

        let BackupOutcome::Completed { path, .. } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };
        let names = entry_names(&path);
        assert!(names.contains("plugins/other.jar"));
        assert!(names.iter().all(|n| !n.starts_with("plugins/Essentials")));
        Ok(())
    }

    #[tokio::test]
    async fn test_configured_ignores_are_permanent() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        fs::create_dir_all(temp_dir.path().join("logs"))?;
        fs::write(temp_dir.path().join("logs/latest.log"), b"log")?;
        let mut config = test_config(temp_dir.path());
        config.backup.ignore = vec![PathBuf::from("logs"), PathBuf::from("worldA")];
        let (_host, manager) = directory_manager(config);

        let BackupOutcome::Completed { path, .. } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };
        let names = entry_names(&path);
        assert!(names.iter().all(|n| !n.starts_with("logs") && !n.starts_with("worldA")));
        assert_eq!(manager.ignore().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_back_to_back_runs_write_one_archive() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let (_host, manager) = directory_manager(test_config(temp_dir.path()));

        let (first, second) = tokio::join!(
            manager.run_backup(false, false),
            manager.run_backup(false, false)
        );

        assert!(matches!(first, BackupOutcome::Completed { .. }));
        assert!(matches!(
            second,
            BackupOutcome::Skipped(SkipReason::BackupInProgress)
        ));
        assert_eq!(archives_in(&temp_dir.path().join("backups")).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_host_is_skipped() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let (host, manager) = directory_manager(test_config(temp_dir.path()));
        host.disable();

        let outcome = manager.run_backup(true, true).await;
        assert!(matches!(outcome, BackupOutcome::Skipped(SkipReason::HostDisabled)));
        assert!(!temp_dir.path().join("backups").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_runs_before_archive() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let backups = temp_dir.path().join("backups");
        fs::create_dir_all(&backups)?;
        for (name, age) in [("old-1.zip", 300), ("old-2.zip", 200), ("old-3.zip", 100)] {
            let file = File::create(backups.join(name))?;
            file.set_times(FileTimes::new().set_modified(SystemTime::now() - Duration::from_secs(age)))?;
        }
        let mut config = test_config(temp_dir.path());
        config.backup.max_backups = 2;
        let (_host, manager) = directory_manager(config);

        let BackupOutcome::Completed { path, .. } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };

        let remaining = archives_in(&backups);
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&backups.join("old-3.zip")));
        assert!(remaining.contains(&path));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_releases_lock_and_ignores() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        // A file where the backup directory should be
        fs::write(temp_dir.path().join("backups"), b"not a directory")?;
        let (host, manager) = directory_manager(test_config(temp_dir.path()));

        let outcome = manager.run_backup(false, false).await;
        assert!(matches!(outcome, BackupOutcome::Failed(_)));
        assert!(!manager.is_running());
        assert!(manager.ignore().is_empty());
        assert!(host.directory_datasets()[0].auto_flush());

        fs::remove_file(temp_dir.path().join("backups"))?;
        assert!(matches!(
            manager.run_backup(false, false).await,
            BackupOutcome::Completed { .. }
        ));
        Ok(())
    }

    struct RecordingDataset {
        root: PathBuf,
        auto_flush: AtomicBool,
        events: Mutex<Vec<String>>,
    }

    impl RecordingDataset {
        fn new(root: PathBuf) -> Self {
            Self {
                root,
                auto_flush: AtomicBool::new(true),
                events: Mutex::new(Vec::new()),
            }
        }

        /// Consecutive duplicates collapse into one event
        fn record(&self, event: String) {
            let mut events = self.events.lock().unwrap();
            if events.last() != Some(&event) {
                events.push(event);
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Dataset for RecordingDataset {
        fn name(&self) -> &str {
            "recorded"
        }

        fn root_path(&self) -> &Path {
            &self.root
        }

        fn flush(&self) -> std::io::Result<()> {
            self.record(format!("flush auto_flush={}", self.auto_flush.load(Ordering::SeqCst)));
            Ok(())
        }

        fn set_auto_flush(&self, enabled: bool) {
            self.auto_flush.store(enabled, Ordering::SeqCst);
            self.record(format!("set auto_flush={}", enabled));
        }
    }

    /// Archive writer that logs the dataset's auto-flush state on every write
    struct ObservedWriter {
        dataset: Arc<RecordingDataset>,
        inner: std::io::Cursor<Vec<u8>>,
        fail: bool,
    }

    impl std::io::Write for ObservedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.dataset
                .record(format!("write auto_flush={}", self.dataset.auto_flush.load(Ordering::SeqCst)));
            if self.fail {
                return Err(std::io::Error::other("disk full"));
            }
            std::io::Write::write(&mut self.inner, buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            std::io::Write::flush(&mut self.inner)
        }
    }

    impl std::io::Seek for ObservedWriter {
        fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
            std::io::Seek::seek(&mut self.inner, pos)
        }
    }

    struct RecordingHost {
        dataset: Arc<RecordingDataset>,
        broadcasts: Mutex<Vec<String>>,
        executed: AtomicUsize,
    }

    impl Host for RecordingHost {
        fn is_enabled(&self) -> bool {
            true
        }

        fn datasets(&self) -> Vec<Arc<dyn Dataset>> {
            vec![self.dataset.clone() as Arc<dyn Dataset>]
        }

        fn broadcast(&self, message: &str) {
            self.broadcasts.lock().unwrap().push(message.to_string());
        }

        fn execute(&self, task: Task) {
            self.executed.fetch_add(1, Ordering::SeqCst);
            task();
        }
    }

    fn recording_host(root: PathBuf) -> Arc<RecordingHost> {
        Arc::new(RecordingHost {
            dataset: Arc::new(RecordingDataset::new(root)),
            broadcasts: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
        })
    }

    fn archive_with_observed_writer(
        host: &RecordingHost,
        config: &Config,
        fail: bool,
    ) -> (Result<ArchiveSummary>, Vec<String>) {
        let ignore = IgnoreSet::new();
        let mut temp_ignore = ignore.scope();
        let datasets = host.datasets();
        let writer = ObservedWriter {
            dataset: host.dataset.clone(),
            inner: std::io::Cursor::new(Vec::new()),
            fail,
        };
        let mut sink = ArchiveSink::new(writer, 6);

        let result = archive_contents(host, config, &ignore, &mut temp_ignore, &datasets, &mut sink);
        // Snapshot before the sink drops and finalizes
        let events = host.dataset.events();
        (result, events)
    }

    #[test]
    fn test_auto_flush_is_off_while_dataset_is_archived() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let config = test_config(temp_dir.path());
        let host = recording_host(temp_dir.path().join("worldA"));

        let (result, events) = archive_with_observed_writer(&host, &config, false);
        let summary = result.unwrap();
        assert!(summary.files >= 2);
        assert_eq!(
            events,
            vec![
                "flush auto_flush=true",
                "set auto_flush=false",
                "write auto_flush=false",
                "set auto_flush=true",
                "write auto_flush=true",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_auto_flush_restored_when_dataset_write_fails() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let config = test_config(temp_dir.path());
        let host = recording_host(temp_dir.path().join("worldA"));

        let (result, events) = archive_with_observed_writer(&host, &config, true);
        assert!(matches!(result, Err(BackupError::Archive(_))));
        assert_eq!(
            events,
            vec![
                "flush auto_flush=true",
                "set auto_flush=false",
                "write auto_flush=false",
                "set auto_flush=true",
            ]
        );
        assert!(host.dataset.auto_flush.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_ignore_created_later_under_symlinked_root() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let link_parent = TempDir::new()?;
        let link = link_parent.path().join("server");
        std::os::unix::fs::symlink(temp_dir.path(), &link)?;

        let mut config = test_config(&link);
        config.backup.ignore = vec![PathBuf::from("logs")];
        let (_host, manager) = directory_manager(config);

        fs::create_dir_all(temp_dir.path().join("logs"))?;
        fs::write(temp_dir.path().join("logs/latest.log"), b"log")?;

        let BackupOutcome::Completed { path, .. } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };
        let names = entry_names(&path);
        assert!(names.contains("worldA/level.dat"));
        assert!(names.contains("server.properties"));
        assert!(names.iter().all(|n| !n.starts_with("logs")));
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduled_run_flushes_on_host_and_broadcasts() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let host = recording_host(temp_dir.path().join("worldA"));
        let manager = BackupManager::new(host.clone(), test_config(temp_dir.path()));

        let outcome = manager.run_backup(false, true).await;
        assert!(matches!(outcome, BackupOutcome::Completed { .. }));

        assert_eq!(host.executed.load(Ordering::SeqCst), 1);
        // Flushed once with auto-flush still on, then the restore guard runs
        assert_eq!(
            host.dataset.events(),
            vec![
                "flush auto_flush=true",
                "set auto_flush=false",
                "set auto_flush=true",
            ]
        );
        assert!(host.dataset.auto_flush.load(Ordering::SeqCst));
        assert_eq!(
            *host.broadcasts.lock().unwrap(),
            vec!["Starting scheduled backup...", "Scheduled backup complete!"]
        );
        Ok(())
    }

    struct AcceptingTransport;

    impl RemoteTransport for AcceptingTransport {
        fn connect(&mut self) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        fn put(&mut self, _local: &Path) -> std::result::Result<bool, UploadError> {
            Ok(true)
        }

        fn delete(&mut self, _file_name: &str) -> std::result::Result<(), UploadError> {
            Ok(())
        }

        fn disconnect(&mut self) -> std::result::Result<(), UploadError> {
            Ok(())
        }
    }

    struct AcceptingConnector;

    impl Connector for AcceptingConnector {
        fn open(&self, _kind: TransportKind, _config: &UploadConfig) -> Box<dyn RemoteTransport> {
            Box::new(AcceptingTransport)
        }
    }

    #[tokio::test]
    async fn test_upload_hand_off() -> std::io::Result<()> {
        let temp_dir = server_tree()?;
        let mut config = test_config(temp_dir.path());
        config.upload.enabled = true;
        config.upload.host = "backup.example.com".to_string();
        config.upload.delete_local_after_upload = true;
        let host = Arc::new(DirectoryHost::from_config(&config.server)?);
        let uploader = Arc::new(Uploader::with_connector(
            config.upload.clone(),
            Arc::new(AcceptingConnector),
        ));
        let manager = BackupManager::with_uploader(host, config, uploader);

        let BackupOutcome::Completed { path, upload, .. } = manager.run_backup(true, false).await else {
            panic!("backup did not complete");
        };
        let uploaded = upload.expect("upload was not started").await.unwrap();
        assert!(matches!(uploaded, UploadOutcome::Uploaded { local_deleted: true, .. }));
        assert!(!path.exists());

        // Not requested: no hand-off even though uploading is enabled
        let BackupOutcome::Completed { upload, .. } = manager.run_backup(false, false).await else {
            panic!("backup did not complete");
        };
        assert!(upload.is_none());
        Ok(())
    }
}
