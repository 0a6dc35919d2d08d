//! Filesystem capability used by every pipeline stage.
//!
//! The engine never touches `std::fs` directly: it is handed a [`FileSystem`]
//! so the same orchestration can run against real installed packages
//! ([`OsFileSystem`]) or an in-memory tree ([`MemoryFileSystem`]).

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Read/write/exists capability over a file tree.
pub trait FileSystem {
    /// Whether `path` names an existing regular file.
    fn is_file(&self, path: &Path) -> bool;

    /// Read the whole file as UTF-8.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Replace the file's content. Implementations must never leave a
    /// half-written file behind.
    fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Copy `from` to `to`, overwriting `to`.
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
}

impl<F: FileSystem + ?Sized> FileSystem for &F {
    fn is_file(&self, path: &Path) -> bool {
        (**self).is_file(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        (**self).read_to_string(path)
    }

    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        (**self).write(path, content)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        (**self).copy(from, to)
    }
}

/// The real filesystem. Writes are atomic (tempfile + fsync + rename).
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        atomic_write(path, content.as_bytes())
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to).map(|_| ())
    }
}

/// Atomic file write: tempfile + fsync + rename.
///
/// The temporary file lives in the target's directory so the rename never
/// crosses filesystems. The original file's permissions are carried over,
/// otherwise the rename would leave a 0600 file inside a shared package tree.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Path has no parent directory")
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;

    if let Ok(metadata) = fs::metadata(path) {
        temp.as_file().set_permissions(metadata.permissions())?;
    }

    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[derive(Debug, Clone, Default)]
struct MemoryFile {
    content: String,
    writes: usize,
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<PathBuf, MemoryFile>,
    read_only: BTreeSet<PathBuf>,
    unreadable: BTreeSet<PathBuf>,
}

/// In-memory file tree for tests and dry runs.
///
/// Paths can be marked read-only or unreadable to simulate permission
/// errors. Every successful write is counted per path.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    tree: RefCell<MemoryTree>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file without counting it as a write.
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.tree.borrow_mut().files.insert(
            path.into(),
            MemoryFile {
                content: content.into(),
                writes: 0,
            },
        );
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    /// Make writes to `path` fail with `PermissionDenied`.
    pub fn set_read_only(&self, path: impl Into<PathBuf>) {
        self.tree.borrow_mut().read_only.insert(path.into());
    }

    /// Make reads of `path` fail with `PermissionDenied`.
    pub fn set_unreadable(&self, path: impl Into<PathBuf>) {
        self.tree.borrow_mut().unreadable.insert(path.into());
    }

    /// Current content of `path`, if present.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.tree
            .borrow()
            .files
            .get(path.as_ref())
            .map(|f| f.content.clone())
    }

    /// Number of successful writes to `path` since it was inserted.
    pub fn write_count(&self, path: impl AsRef<Path>) -> usize {
        self.tree
            .borrow()
            .files
            .get(path.as_ref())
            .map_or(0, |f| f.writes)
    }

    /// All file paths currently in the tree.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.tree.borrow().files.keys().cloned().collect()
    }
}

fn permission_denied(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("permission denied: {}", path.display()),
    )
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

impl FileSystem for MemoryFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        self.tree.borrow().files.contains_key(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let tree = self.tree.borrow();
        if tree.unreadable.contains(path) {
            return Err(permission_denied(path));
        }
        tree.files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        if tree.read_only.contains(path) {
            return Err(permission_denied(path));
        }
        let file = tree.files.entry(path.to_path_buf()).or_default();
        file.content = content.to_string();
        file.writes += 1;
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        let content = self.read_to_string(from)?;
        self.write(to, &content)
    }
}
