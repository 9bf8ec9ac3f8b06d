//! Read-only filesystem views.
//!
//! An [`FsView`] is the capability set downstream extractors walk: open a
//! file, list a directory, stat a path. Paths are `/`-separated and relative
//! to the view root; a leading `/` is optional.

mod dir;
mod embedded;
mod path;

use std::io::Read;
use std::time::SystemTime;

use crate::error::Result;

pub use dir::DirFs;
pub use embedded::{BackingResource, EmbeddedDirFs, EntryFilter};
pub use path::{normalize_path, safe_join};

/// Permission bits reported for the synthetic root directory.
pub const ROOT_DIR_MODE: u32 = 0o755;

/// Metadata for one path in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component, `/` for the root.
    pub name: String,
    /// Size in bytes, 0 for directories.
    pub size: u64,
    pub is_dir: bool,
    /// Unix permission bits.
    pub mode: u32,
    pub modified: Option<SystemTime>,
}

impl FileInfo {
    /// Directory info for the root of a view.
    pub fn root() -> Self {
        Self {
            name: "/".to_string(),
            size: 0,
            is_dir: true,
            mode: ROOT_DIR_MODE,
            modified: Some(SystemTime::now()),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

impl DirEntry {
    /// Create an entry for a regular file.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            size,
        }
    }

    /// Create an entry for a directory.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: 0,
        }
    }
}

/// Read-only access to a directory tree.
pub trait FsView: Send + Sync {
    /// Opens a file for reading.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Lists a directory, sorted by name.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Returns metadata for a path.
    fn stat(&self, path: &str) -> Result<FileInfo>;
}
