//! Writing verified content back to the target file.

use crate::fs::FileSystem;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Suffix appended to a target's file name for its one-time backup.
pub const BACKUP_SUFFIX: &str = "backup";

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("failed to back up {path} to {backup}: {source}")]
    Backup {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a successful commit did besides writing the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Set when this commit created a backup.
    pub backup: Option<PathBuf>,
}

/// Writes content through a [`FileSystem`].
///
/// Atomicity comes from the filesystem: [`crate::fs::OsFileSystem`] writes a
/// temporary file next to the target and renames it over the original.
pub struct Committer<'a, F: FileSystem + ?Sized> {
    fs: &'a F,
}

impl<'a, F: FileSystem + ?Sized> Committer<'a, F> {
    pub fn new(fs: &'a F) -> Self {
        Self { fs }
    }

    /// Replace the content of `path` with `new_content`.
    ///
    /// With `backup` set, the current content is first copied to
    /// `<file>.backup` unless that file already exists. A failed backup
    /// aborts the commit and leaves the target untouched.
    pub fn write(
        &self,
        path: &Path,
        new_content: &str,
        backup: bool,
    ) -> Result<CommitReceipt, CommitError> {
        let mut receipt = CommitReceipt::default();

        if backup {
            let backup_path = backup_path(path);
            if self.fs.is_file(&backup_path) {
                debug!(backup = %backup_path.display(), "backup already present, keeping it");
            } else {
                self.fs
                    .copy(path, &backup_path)
                    .map_err(|source| CommitError::Backup {
                        path: path.to_path_buf(),
                        backup: backup_path.clone(),
                        source,
                    })?;
                debug!(backup = %backup_path.display(), "created backup");
                receipt.backup = Some(backup_path);
            }
        }

        self.fs
            .write(path, new_content)
            .map_err(|source| CommitError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(receipt)
    }
}

/// `<file>.backup` next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}
