//! Shipping finished archives to a remote server.
//!
//! At most one upload runs at a time; a request that arrives while another
//! upload is in flight is logged and dropped. The transfer itself runs on the
//! blocking pool so it never holds up a new local backup.

pub mod ftp;
pub mod progress;
pub mod sftp;

use crate::config::UploadConfig;
use crate::executor::lock::OperationLock;
use crate::utils::errors::UploadError;
use progress::{format_bytes, format_duration, format_rate};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Name of the file written for connectivity tests
pub const TEST_FILE_NAME: &str = "uploadtest.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ftp,
    Sftp,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ftp" => Ok(Self::Ftp),
            "sftp" => Ok(Self::Sftp),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ftp => f.write_str("FTP"),
            Self::Sftp => f.write_str("SFTP"),
        }
    }
}

/// A connection to the remote file store. All calls block.
pub trait RemoteTransport: Send {
    fn connect(&mut self) -> Result<(), UploadError>;

    /// Store `local` in the remote directory under its file name.
    /// `Ok(false)` means the server answered but refused the file.
    fn put(&mut self, local: &Path) -> Result<bool, UploadError>;

    fn delete(&mut self, file_name: &str) -> Result<(), UploadError>;

    /// Must be safe to call whether or not `connect` succeeded
    fn disconnect(&mut self) -> Result<(), UploadError>;
}

/// Creates transports for a configured kind
pub trait Connector: Send + Sync {
    fn open(&self, kind: TransportKind, config: &UploadConfig) -> Box<dyn RemoteTransport>;
}

/// Real network transports
#[derive(Debug, Default)]
pub struct NetworkConnector;

impl Connector for NetworkConnector {
    fn open(&self, kind: TransportKind, config: &UploadConfig) -> Box<dyn RemoteTransport> {
        match kind {
            TransportKind::Ftp => Box::new(ftp::FtpTransport::new(config.clone())),
            TransportKind::Sftp => Box::new(sftp::SftpTransport::new(config.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64, local_deleted: bool },
    Tested,
    Failed(String),
}

/// Upload manager with its own exclusivity lock
pub struct Uploader {
    config: UploadConfig,
    connector: Arc<dyn Connector>,
    lock: OperationLock,
}

impl Uploader {
    pub fn new(config: UploadConfig) -> Self {
        Self::with_connector(config, Arc::new(NetworkConnector))
    }

    pub fn with_connector(config: UploadConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            lock: OperationLock::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_uploading(&self) -> bool {
        self.lock.is_held()
    }

    /// Start uploading `local` in the background.
    ///
    /// Returns `None` when the upload is skipped: another upload is running
    /// or the configured transport kind is unknown.
    pub fn upload(&self, local: PathBuf, is_test: bool) -> Option<JoinHandle<UploadOutcome>> {
        if self.lock.is_held() {
            warn!("An upload was scheduled to happen now, but an upload is already in progress. Skipping...");
            return None;
        }

        let kind = match self.config.kind.parse::<TransportKind>() {
            Ok(kind) => kind,
            Err(other) => {
                warn!(
                    "Invalid upload type {:?} specified (only ftp/sftp accepted). Skipping upload...",
                    other
                );
                return None;
            }
        };

        let Some(guard) = self.lock.try_acquire() else {
            warn!("An upload was scheduled to happen now, but an upload is already in progress. Skipping...");
            return None;
        };

        info!("Starting upload of {} to {} server...", local.display(), kind);
        let config = self.config.clone();
        let connector = Arc::clone(&self.connector);

        Some(tokio::spawn(async move {
            let outcome = run_upload(connector, kind, config, local, is_test).await;
            drop(guard);
            outcome
        }))
    }

    /// Upload (and remove again) a small file to check connectivity
    pub async fn test_upload(&self, data_dir: &Path) -> Option<JoinHandle<UploadOutcome>> {
        let path = data_dir.join(TEST_FILE_NAME);
        let created = async {
            tokio::fs::create_dir_all(data_dir).await?;
            tokio::fs::write(&path, b"").await
        };
        if let Err(e) = created.await {
            warn!("Error creating temporary file {}: {}", path.display(), e);
            return None;
        }

        let handle = self.upload(path.clone(), true);
        if handle.is_none() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Unable to remove temporary file {}: {}", path.display(), e);
            }
        }
        handle
    }
}

async fn run_upload(
    connector: Arc<dyn Connector>,
    kind: TransportKind,
    config: UploadConfig,
    local: PathBuf,
    is_test: bool,
) -> UploadOutcome {
    let started = Instant::now();
    let transfer_config = config.clone();
    let transfer_local = local.clone();

    let result = tokio::task::spawn_blocking(move || {
        transfer(connector.as_ref(), kind, &transfer_config, &transfer_local, is_test)
    })
    .await
    .unwrap_or_else(|e| Err(UploadError::Worker(e.to_string())));

    match result {
        Ok(_) if is_test => {
            if let Err(e) = tokio::fs::remove_file(&local).await {
                warn!("Unable to delete test file {}: {}", local.display(), e);
            }
            info!("Test upload successful!");
            UploadOutcome::Tested
        }
        Ok(bytes) => {
            let elapsed = started.elapsed();
            info!(
                "Upload of {} has succeeded! ({} in {}, {})",
                local.display(),
                format_bytes(bytes),
                format_duration(elapsed),
                format_rate(bytes, elapsed)
            );
            let local_deleted = config.delete_local_after_upload && delete_after_upload(&local).await;
            UploadOutcome::Uploaded {
                bytes,
                local_deleted,
            }
        }
        Err(e) => {
            error!(error = ?e, "Upload of {} has failed: {}", local.display(), e);
            UploadOutcome::Failed(e.to_string())
        }
    }
}

async fn delete_after_upload(local: &Path) -> bool {
    match tokio::fs::remove_file(local).await {
        Ok(()) => {
            info!("Successfully deleted {} after upload.", local.display());
            true
        }
        Err(e) => {
            warn!("Unable to delete {} after upload: {}", local.display(), e);
            false
        }
    }
}

/// Connect, store, optionally remove the test file, and always disconnect
fn transfer(
    connector: &dyn Connector,
    kind: TransportKind,
    config: &UploadConfig,
    local: &Path,
    is_test: bool,
) -> Result<u64, UploadError> {
    let name = file_name(local)?;
    let bytes = std::fs::metadata(local)?.len();

    let mut transport = connector.open(kind, config);
    let result = send(transport.as_mut(), local, &name, is_test);
    if let Err(e) = transport.disconnect() {
        warn!("Failed to close {} connection: {}", kind, e);
    }

    result.map(|_| bytes)
}

fn send(
    transport: &mut dyn RemoteTransport,
    local: &Path,
    name: &str,
    is_test: bool,
) -> Result<(), UploadError> {
    transport.connect()?;
    if !transport.put(local)? {
        return Err(UploadError::StoreRejected(name.to_string()));
    }
    if is_test {
        transport.delete(name)?;
    }
    Ok(())
}

pub(crate) fn file_name(local: &Path) -> Result<String, UploadError> {
    local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", local.display()),
            ))
        })
}

/// `<remote_dir>/<file_name>`; an empty directory means the login directory
pub(crate) fn remote_file_path(remote_dir: &str, file_name: &str) -> String {
    if remote_dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", remote_dir.trim_end_matches('/'), file_name)
    }
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, UploadError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| UploadError::Resolve(format!("{}:{}", host, port)))
}
