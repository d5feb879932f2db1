//! Error types for the backup pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Cron expression parsing and prediction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("Expected 5 fields (minute hour day month weekday), got {0}: {1:?}")]
    FieldCount(usize, String),

    #[error("Invalid cron expression {expression:?}: {reason}")]
    Parse { expression: String, reason: String },

    #[error("Expression {0:?} never matches a future date")]
    NeverFires(String),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] CronError),
}

/// Errors that abort writing an archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to write archive entry {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a backup run
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Flush of dataset {0} failed: {1}")]
    Flush(String, std::io::Error),

    #[error("Host executor dropped the flush request for dataset {0}")]
    FlushAbandoned(String),

    #[error("Invalid date format {0:?}")]
    DateFormat(String),

    #[error("Backup worker panicked: {0}")]
    Worker(String),
}

/// Errors that abort an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Remote server refused to store {0}")]
    StoreRejected(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Upload worker panicked: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
