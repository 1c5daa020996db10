//! Local filesystem resource accessor

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::result::{Error, Result};
use crate::ports::ResourceAccessor;

/// Resolves logical changelog paths against a root directory
#[derive(Debug, Clone)]
pub struct FileSystemAccessor {
    root: PathBuf,
}

impl FileSystemAccessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            resolved.push(part);
        }
        resolved
    }
}

impl ResourceAccessor for FileSystemAccessor {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                Error::parse(path, format!("file not found: {}", full.display()))
            }
            _ => Error::Io(e),
        })
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full = self.resolve(dir);
        let prefix = dir.trim_end_matches('/');

        let mut paths = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if prefix.is_empty() {
                paths.push(name);
            } else {
                paths.push(format!("{}/{}", prefix, name));
            }
        }
        paths.sort();
        Ok(paths)
    }
}
