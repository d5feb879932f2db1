//! Configuration management for the backup service.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`WORLD_BACKUP_BACKUP__MAX_BACKUPS=3` sets `backup.max_backups`).

use crate::schedule::cron::CronExpression;
use crate::utils::errors::ConfigError;
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Token in `backup.filename_template` replaced by the formatted date
pub const DATE_TOKEN: &str = "{DATE}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backup: BackupConfig,
    pub upload: UploadConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Working directory that gets archived
    pub root: PathBuf,

    /// Directory holding plugin binaries and plugin configuration folders
    pub plugin_dir: PathBuf,

    /// Scratch directory (connectivity test files)
    pub data_dir: PathBuf,

    /// Dataset directories exposed by the bundled directory host
    pub datasets: Vec<PathBuf>,

    /// Extension of plugin binaries
    pub plugin_binary_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Archives to keep; 0 or less keeps all of them
    pub max_backups: i64,

    /// Where archives are written
    pub directory: PathBuf,

    /// Archive name without extension, `{DATE}` is substituted
    pub filename_template: String,

    /// chrono strftime pattern for `{DATE}`
    pub date_format: String,

    /// 0 (store) to 9 (best)
    pub compression_level: u32,

    pub backup_plugin_binaries: bool,

    pub backup_plugin_configs: bool,

    /// Five-field cron expression
    pub schedule: String,

    /// Paths that are never archived
    pub ignore: Vec<PathBuf>,

    /// How often the scheduler checks the cron expression
    pub poll_interval_secs: u64,

    /// Upload scheduled backups when uploading is enabled
    pub upload_scheduled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,

    /// `ftp` or `sftp`
    pub kind: String,

    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: String,

    /// Remote directory the archive is stored in
    pub remote_path: String,

    /// SFTP only: authenticate with a private key instead of the password
    pub use_key_auth: bool,

    pub private_key_path: PathBuf,

    /// Empty for unencrypted keys
    pub private_key_passphrase: String,

    pub delete_local_after_upload: bool,

    /// Connect/read/write timeout for transport operations
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            plugin_dir: PathBuf::from("plugins"),
            data_dir: PathBuf::from("plugins/world-backup"),
            datasets: Vec::new(),
            plugin_binary_suffix: "jar".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: 7,
            directory: PathBuf::from("backups"),
            filename_template: format!("backup-{}", DATE_TOKEN),
            date_format: "%Y-%m-%d-%H-%M-%S".to_string(),
            compression_level: 6,
            backup_plugin_binaries: false,
            backup_plugin_configs: true,
            schedule: "0 */6 * * *".to_string(),
            ignore: Vec::new(),
            poll_interval_secs: 30,
            upload_scheduled: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: "ftp".to_string(),
            host: String::new(),
            port: 21,
            user: String::new(),
            password: String::new(),
            remote_path: "/".to_string(),
            use_key_auth: false,
            private_key_path: PathBuf::new(),
            private_key_passphrase: String::new(),
            delete_local_after_upload: false,
            timeout_secs: 180,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus `WORLD_BACKUP_*` overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("WORLD_BACKUP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the pipeline cannot recover from at run time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backup.compression_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "backup.compression_level must be 0-9, got {}",
                self.backup.compression_level
            )));
        }
        if self.backup.filename_template.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "backup.filename_template must not be empty".to_string(),
            ));
        }
        if !self.backup.filename_template.contains(DATE_TOKEN) {
            warn!(
                "backup.filename_template has no {} token, each backup will replace the previous one",
                DATE_TOKEN
            );
        }
        if StrftimeItems::new(&self.backup.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Invalid(format!(
                "backup.date_format {:?} is not a valid strftime pattern",
                self.backup.date_format
            )));
        }
        if self.backup.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "backup.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        CronExpression::parse(&self.backup.schedule)?;

        if self.upload.enabled && self.upload.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upload.host is required when upload is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a configured path against the server root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.server.root.join(path)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup.directory)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.resolve(&self.server.plugin_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.server.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backup.max_backups, 7);
        assert_eq!(config.upload.timeout_secs, 180);
    }

    #[test]
    fn test_load_partial_file() -> anyhow::Result<()> {
        let mut file = NamedTempFile::with_suffix(".toml")?;
        writeln!(
            file,
            r#"
[backup]
max_backups = 3
schedule = "0 3 * * *"

[upload]
enabled = true
kind = "ftp"
host = "backup.example.com"
"#
        )?;

        let config = Config::from_file(file.path())?;
        assert_eq!(config.backup.max_backups, 3);
        assert_eq!(config.backup.schedule, "0 3 * * *");
        assert_eq!(config.backup.filename_template, "backup-{DATE}");
        assert_eq!(config.upload.kind, "ftp");
        assert_eq!(config.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.backup.compression_level = 12;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.backup.schedule = "every day".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));

        let mut config = Config::default();
        config.backup.date_format = "%Y-%Q".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.upload.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.backup.date_format, config.backup.date_format);
    }
}
