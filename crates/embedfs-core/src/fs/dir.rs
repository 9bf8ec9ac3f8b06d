use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::path::{normalize_path, safe_join};
use super::{DirEntry, FileInfo, FsView};

/// A view over a real directory on the host.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        safe_join(&self.root, Path::new(normalized.trim_start_matches('/')))
    }
}

fn name_of(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn info_from(name: String, metadata: &Metadata) -> FileInfo {
    FileInfo {
        name,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        is_dir: metadata.is_dir(),
        mode: mode_of(metadata),
        modified: metadata.modified().ok(),
    }
}

impl FsView for DirFs {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full).map_err(|e| Error::io(e, &full))?;
        if metadata.is_dir() {
            return Err(Error::io(
                io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
                &full,
            ));
        }
        let file = File::open(&full).map_err(|e| Error::io(e, &full))?;
        Ok(Box::new(file))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let full = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full).map_err(|e| Error::io(e, &full))? {
            let entry = entry.map_err(|e| Error::io(e, &full))?;
            let metadata = entry.metadata().map_err(|e| Error::io(e, entry.path()))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full).map_err(|e| Error::io(e, &full))?;
        Ok(info_from(name_of(path), &metadata))
    }
}
