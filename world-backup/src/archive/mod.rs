//! Zip archive writing.
//!
//! [`ArchiveSink`] wraps a [`ZipWriter`] with the configured compression, and
//! [`write_tree`] streams a directory tree into it. Source files that cannot be
//! read are left out with a warning; failures of the sink itself abort.

use crate::fs::ignore::IgnoreSet;
use crate::fs::walker::{walk_tree, VisitedSet, WalkItem};
use crate::utils::errors::ArchiveError;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Read buffer for streaming file contents
const CHUNK_SIZE: usize = 64 * 1024;

/// Result of adding one file to the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Written { bytes: u64 },
    Skipped { reason: String },
}

/// A file left out of the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Totals for one or more [`write_tree`] passes
#[derive(Debug, Default, Clone)]
pub struct ArchiveSummary {
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
    pub skipped: Vec<SkippedFile>,
}

impl ArchiveSummary {
    pub fn merge(&mut self, other: ArchiveSummary) {
        self.directories += other.directories;
        self.files += other.files;
        self.bytes += other.bytes;
        self.skipped.extend(other.skipped);
    }
}

/// An open zip archive that entries are streamed into
pub struct ArchiveSink<W: Write + Seek> {
    zip: ZipWriter<W>,
    file_options: SimpleFileOptions,
    dir_options: SimpleFileOptions,
}

impl ArchiveSink<BufWriter<File>> {
    /// Create the archive file at `path`
    pub fn create(path: &Path, compression_level: u32) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufWriter::new(file), compression_level))
    }

    /// Finish the archive and flush it to disk
    pub fn close(self, path: &Path) -> Result<(), ArchiveError> {
        let io_err = |source: std::io::Error| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = self
            .finish()?
            .into_inner()
            .map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)
    }
}

impl<W: Write + Seek> ArchiveSink<W> {
    /// Level 0 stores entries uncompressed, 1-9 deflates.
    pub fn new(writer: W, compression_level: u32) -> Self {
        let level = compression_level.min(9);
        let file_options = if level == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(level)))
        };
        let dir_options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        Self {
            zip: ZipWriter::new(writer),
            file_options,
            dir_options,
        }
    }

    /// Add an empty directory entry; `name` gets exactly one trailing `/`.
    pub fn add_directory(&mut self, name: &str) -> Result<(), ArchiveError> {
        let name = format!("{}/", name.trim_end_matches('/'));
        self.zip.add_directory(name, self.dir_options)?;
        Ok(())
    }

    /// Stream `source` into a new entry called `name`.
    ///
    /// Read failures drop the partial entry and return [`FileOutcome::Skipped`].
    pub fn add_file(&mut self, name: &str, source: &Path) -> Result<FileOutcome, ArchiveError> {
        let mut file = match File::open(source) {
            Ok(f) => f,
            Err(e) => return Ok(FileOutcome::Skipped { reason: e.to_string() }),
        };
        let large = file
            .metadata()
            .map(|m| m.len() >= u32::MAX as u64)
            .unwrap_or(false);

        self.zip
            .start_file(name, self.file_options.large_file(large))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.zip.abort_file()?;
                    return Ok(FileOutcome::Skipped { reason: e.to_string() });
                }
            };

            self.zip
                .write_all(&buffer[..n])
                .map_err(|source| ArchiveError::Write {
                    name: name.to_string(),
                    source,
                })?;
            written += n as u64;
        }

        Ok(FileOutcome::Written { bytes: written })
    }

    /// Write the central directory and hand back the underlying writer
    pub fn finish(self) -> Result<W, ArchiveError> {
        Ok(self.zip.finish()?)
    }
}

/// Archive everything under `root` as `archive_name`, skipping ignored and
/// already visited paths.
///
/// An empty `archive_name` places the tree's contents at the top of the
/// archive without a directory entry for the root itself.
pub fn write_tree<W: Write + Seek>(
    root: &Path,
    archive_name: &str,
    sink: &mut ArchiveSink<W>,
    ignore: &IgnoreSet,
    visited: &mut VisitedSet,
) -> Result<ArchiveSummary, ArchiveError> {
    let mut summary = ArchiveSummary::default();

    walk_tree(root, archive_name, ignore, visited, |item| {
        match item {
            WalkItem::Entry(entry) if entry.is_dir => {
                if !entry.archive_name.is_empty() {
                    sink.add_directory(&entry.archive_name)?;
                    summary.directories += 1;
                }
            }
            WalkItem::Entry(entry) => match sink.add_file(&entry.archive_name, &entry.path)? {
                FileOutcome::Written { bytes } => {
                    debug!("Archived {} ({} bytes)", entry.archive_name, bytes);
                    summary.files += 1;
                    summary.bytes += bytes;
                }
                FileOutcome::Skipped { reason } => {
                    warn!(
                        "Error while backing up file {}, backup will ignore this file: {}",
                        entry.archive_name, reason
                    );
                    summary.skipped.push(SkippedFile {
                        path: entry.path,
                        reason,
                    });
                }
            },
            WalkItem::Unreadable { path, reason } => {
                warn!(
                    "Unable to read {}, backup will ignore it: {}",
                    path.display(),
                    reason
                );
                summary.skipped.push(SkippedFile { path, reason });
            }
        }
        Ok::<(), ArchiveError>(())
    })?;

    Ok(summary)
}
