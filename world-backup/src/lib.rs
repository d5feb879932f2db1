//! World backup library
//!
//! Scheduled zip backups of a live server directory: datasets are flushed and
//! archived first, then the rest of the server root, old archives are pruned,
//! and finished archives can be shipped to an FTP or SFTP server.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod host;
pub mod schedule;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupManager, BackupOutcome};
pub use transfer::{UploadOutcome, Uploader};
pub use utils::errors::{BackupError, Result};
