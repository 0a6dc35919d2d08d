use crate::fs::FileSystem;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Where a dependency's file might live.
///
/// `candidate_roots` are tried in order; the first root under which
/// `relative_path` exists wins. There is no merging across roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    pub relative_path: PathBuf,
    pub candidate_roots: Vec<PathBuf>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("relative path must not be absolute: {0}")]
    AbsolutePath(PathBuf),

    #[error("relative path escapes its package root: {0}")]
    EscapesRoot(PathBuf),

    #[error("relative path is empty")]
    Empty,
}

/// Outcome of resolving a target. `NotFound` is a normal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    NotFound,
}

impl TargetDescriptor {
    pub fn new(relative_path: impl Into<PathBuf>, candidate_roots: Vec<PathBuf>) -> Self {
        Self {
            relative_path: relative_path.into(),
            candidate_roots,
        }
    }

    /// Check that `relative_path` stays inside whichever root it is joined to.
    pub fn check_relative_path(&self) -> Result<(), ResolveError> {
        check_relative_path(&self.relative_path)
    }

    /// Every path that would be checked, in resolution order.
    pub fn candidates(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.candidate_roots
            .iter()
            .map(move |root| root.join(&self.relative_path))
    }
}

/// Lexically validate a package-relative path.
pub fn check_relative_path(path: &Path) -> Result<(), ResolveError> {
    if path.as_os_str().is_empty() {
        return Err(ResolveError::Empty);
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(ResolveError::EscapesRoot(path.to_path_buf())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(ResolveError::AbsolutePath(path.to_path_buf()))
            }
        }
    }
    Ok(())
}

/// Return the first candidate that exists as a file.
pub fn resolve<F: FileSystem>(fs: &F, target: &TargetDescriptor) -> Resolution {
    target
        .candidates()
        .find(|candidate| fs.is_file(candidate))
        .map_or(Resolution::NotFound, Resolution::Found)
}

/// Expand a leading `~/` against the current user's home directory.
pub fn expand_home(root: &str) -> PathBuf {
    if let Some(rest) = root.strip_prefix("~/") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;

    fn target() -> TargetDescriptor {
        TargetDescriptor::new(
            "hloc/reconstruction.py",
            vec![
                PathBuf::from("/usr/local/lib/python3.10/dist-packages"),
                PathBuf::from("/usr/local/lib/python3.10/site-packages"),
                PathBuf::from("/opt/conda/lib/python3.10/site-packages"),
            ],
        )
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let fs = MemoryFileSystem::new()
            .with_file("/opt/conda/lib/python3.10/site-packages/hloc/reconstruction.py", "")
            .with_file("/usr/local/lib/python3.10/site-packages/hloc/reconstruction.py", "");

        assert_eq!(
            resolve(&fs, &target()),
            Resolution::Found(PathBuf::from(
                "/usr/local/lib/python3.10/site-packages/hloc/reconstruction.py"
            ))
        );
    }

    #[test]
    fn test_resolve_not_found() {
        let fs = MemoryFileSystem::new().with_file("/elsewhere/hloc/reconstruction.py", "");
        assert_eq!(resolve(&fs, &target()), Resolution::NotFound);
    }

    #[test]
    fn test_resolve_no_roots() {
        let fs = MemoryFileSystem::new();
        let target = TargetDescriptor::new("hloc/__init__.py", vec![]);
        assert_eq!(resolve(&fs, &target), Resolution::NotFound);
    }

    #[test]
    fn test_resolve_on_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let second = temp_dir.path().join("second");
        std::fs::create_dir_all(second.join("hloc")).unwrap();
        std::fs::write(second.join("hloc/__init__.py"), "").unwrap();

        let target = TargetDescriptor::new(
            "hloc/__init__.py",
            vec![temp_dir.path().join("first"), second.clone()],
        );
        assert_eq!(
            resolve(&crate::fs::OsFileSystem, &target),
            Resolution::Found(second.join("hloc/__init__.py"))
        );
    }

    #[test]
    fn test_check_relative_path() {
        assert!(check_relative_path(Path::new("hloc/utils/parsers.py")).is_ok());
        assert!(check_relative_path(Path::new("./hloc/__init__.py")).is_ok());
        assert_eq!(
            check_relative_path(Path::new("../etc/passwd")),
            Err(ResolveError::EscapesRoot(PathBuf::from("../etc/passwd")))
        );
        assert!(matches!(
            check_relative_path(Path::new("/etc/passwd")),
            Err(ResolveError::AbsolutePath(_))
        ));
        assert_eq!(check_relative_path(Path::new("")), Err(ResolveError::Empty));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/usr/lib/python3/dist-packages"),
            PathBuf::from("/usr/lib/python3/dist-packages")
        );
    }
}
