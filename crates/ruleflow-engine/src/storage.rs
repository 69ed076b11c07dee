//! File storage seen by the engine.
//!
//! Existence and modification times are always queried live. Paths are the
//! workflow-relative strings used throughout the job graph; [`LocalStorage`]
//! resolves them against its root directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub trait Storage: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    /// Modification time, or `None` when the file is missing.
    fn modified(&self, path: &str) -> Option<SystemTime>;

    /// Remove a file. A file that is already gone is not an error.
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Create every missing parent directory of `path`.
    fn create_parent_dirs(&self, path: &str) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the root if it is not absolute.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Storage for LocalStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn modified(&self, path: &str) -> Option<SystemTime> {
        std::fs::metadata(self.resolve(path))
            .and_then(|m| m.modified())
            .ok()
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let resolved = self.resolve(path);
        let result = if resolved.is_dir() {
            std::fs::remove_dir_all(&resolved)
        } else {
            std::fs::remove_file(&resolved)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn create_parent_dirs(&self, path: &str) -> io::Result<()> {
        match self.resolve(path).parent() {
            Some(parent) => std::fs::create_dir_all(parent),
            None => Ok(()),
        }
    }
}

/// Normalize a workflow path so equal files compare equal as strings.
///
/// Drops `.` components and repeated separators. `..` is kept as written.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
