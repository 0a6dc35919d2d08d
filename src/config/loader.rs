use crate::config::schema::{PatchConfig, ValidationError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read patch file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse patch TOML{}: {source}", located(.path))]
    Toml {
        path: Option<PathBuf>,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("invalid patch file{}:\n{source}", located(.path))]
    Validation {
        path: Option<PathBuf>,
        #[source]
        source: ValidationError,
    },

    #[error("no .toml patch files found in {}", .path.display())]
    NoPatchFiles { path: PathBuf },
}

fn located(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" ({})", p.display()))
        .unwrap_or_default()
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        match self {
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path.to_path_buf()),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        }
    }
}

pub fn load_from_str(input: &str) -> Result<PatchConfig, ConfigError> {
    let config: PatchConfig = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    config
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(config)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<PatchConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Load several patch files, preserving file order.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<(PathBuf, PatchConfig)>, ConfigError> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            load_from_path(path).map(|config| (path.to_path_buf(), config))
        })
        .collect()
}

/// Result of loading a set of patch files one by one.
#[derive(Debug, Default)]
pub struct LoadedPatches {
    pub configs: Vec<(PathBuf, PatchConfig)>,
    pub failures: Vec<(PathBuf, ConfigError)>,
}

/// Load every file independently, preserving file order.
///
/// A file that cannot be read, parsed or validated lands in `failures`; the
/// remaining files still load.
pub fn load_each<P: AsRef<Path>>(paths: &[P]) -> LoadedPatches {
    let mut loaded = LoadedPatches::default();
    for path in paths {
        let path = path.as_ref().to_path_buf();
        match load_from_path(&path) {
            Ok(config) => loaded.configs.push((path, config)),
            Err(err) => loaded.failures.push((path, err)),
        }
    }
    loaded
}

/// Patch files named by `location`: the file itself, or every `*.toml`
/// directly inside the directory, sorted by name.
pub fn discover_patch_files(location: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if location.is_file() {
        return Ok(vec![location.to_path_buf()]);
    }
    if !location.is_dir() {
        return Err(ConfigError::NoPatchFiles {
            path: location.to_path_buf(),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(location).max_depth(1) {
        let entry = entry.map_err(|err| ConfigError::Io {
            path: location.to_path_buf(),
            source: err.into(),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some("toml")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(ConfigError::NoPatchFiles {
            path: location.to_path_buf(),
        });
    }
    Ok(files)
}
