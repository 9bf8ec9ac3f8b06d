//! Reference-counted handle over extracted or mounted content.
//!
//! Every handle created with [`EmbeddedDirFs::share`] points at the same
//! shared state. The close that brings the count to zero releases the
//! backing resource and deletes the temporary paths; every other close only
//! decrements.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::path::normalize_path;
use super::{DirEntry, FileInfo, FsView};

/// Post-processing applied to every directory listing.
pub type EntryFilter = Arc<dyn Fn(Vec<DirEntry>) -> Vec<DirEntry> + Send + Sync>;

/// A resource that must be released when the last handle closes.
pub trait BackingResource: Send {
    fn release(self: Box<Self>) -> io::Result<()>;
}

impl BackingResource for File {
    fn release(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl BackingResource for NamedTempFile {
    fn release(self: Box<Self>) -> io::Result<()> {
        (*self).close()
    }
}

impl BackingResource for TempDir {
    fn release(self: Box<Self>) -> io::Result<()> {
        (*self).close()
    }
}

struct SharedState {
    ref_count: usize,
    resource: Option<Box<dyn BackingResource>>,
    tmp_paths: Vec<PathBuf>,
}

/// A reference-counted, read-only view over temporary filesystem state.
///
/// Every handle from [`EmbeddedDirFs::share`] counts as one reference. The
/// backing resource is released and the temp paths are removed exactly once,
/// when the last reference is closed or dropped.
pub struct EmbeddedDirFs {
    view: Arc<dyn FsView>,
    shared: Arc<Mutex<SharedState>>,
    released: AtomicBool,
    entry_filter: Option<EntryFilter>,
}

impl EmbeddedDirFs {
    /// Creates the first handle, with a reference count of one.
    pub fn new(
        view: Arc<dyn FsView>,
        resource: Option<Box<dyn BackingResource>>,
        tmp_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            view,
            shared: Arc::new(Mutex::new(SharedState {
                ref_count: 1,
                resource,
                tmp_paths,
            })),
            released: AtomicBool::new(false),
            entry_filter: None,
        }
    }

    /// Applies `filter` to every `read_dir` result of this handle and its shares.
    pub fn with_entry_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Vec<DirEntry>) -> Vec<DirEntry> + Send + Sync + 'static,
    {
        self.entry_filter = Some(Arc::new(filter));
        self
    }

    fn state(&self) -> MutexGuard<'_, SharedState> {
        // Cleanup must still run if another holder panicked mid-close.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Creates another handle to the same content and bumps the count.
    pub fn share(&self) -> Result<Self> {
        self.ensure_open()?;
        let mut state = self.state();
        if state.ref_count == 0 {
            return Err(Error::Closed);
        }
        state.ref_count += 1;
        Ok(Self {
            view: Arc::clone(&self.view),
            shared: Arc::clone(&self.shared),
            released: AtomicBool::new(false),
            entry_filter: self.entry_filter.clone(),
        })
    }

    /// Current number of open handles.
    pub fn ref_count(&self) -> usize {
        self.state().ref_count
    }

    /// Temporary paths registered for cleanup.
    pub fn temp_paths(&self) -> Vec<PathBuf> {
        self.state().tmp_paths.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.ensure_open()?;
        self.view.open(path)
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.ensure_open()?;
        let entries = self.view.read_dir(path)?;
        Ok(match &self.entry_filter {
            Some(filter) => filter(entries),
            None => entries,
        })
    }

    /// Stats `path`. The root always reports a directory.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        self.ensure_open()?;
        if normalize_path(path) == "/" {
            return Ok(self
                .view
                .stat(path)
                .ok()
                .filter(|info| info.is_dir)
                .unwrap_or_else(FileInfo::root));
        }
        self.view.stat(path)
    }

    /// Releases this handle.
    ///
    /// The last handle to close releases the backing resource and removes
    /// every temp path, reporting all failures together. Closing the same
    /// handle again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.state();
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            debug!(remaining = state.ref_count, "embedded filesystem handle closed");
            return Ok(());
        }

        let mut failures = Vec::new();
        if let Some(resource) = state.resource.take() {
            if let Err(e) = resource.release() {
                failures.push(format!("release backing resource: {}", e));
            }
        }
        for path in &state.tmp_paths {
            if let Err(e) = remove_path(path) {
                failures.push(format!("remove {}: {}", path.display(), e));
            }
        }

        debug!(
            paths = state.tmp_paths.len(),
            failures = failures.len(),
            "embedded filesystem cleaned up"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup { failures })
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Drop for EmbeddedDirFs {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "cleanup of dropped embedded filesystem failed");
        }
    }
}

impl fmt::Debug for EmbeddedDirFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedDirFs")
            .field("ref_count", &self.ref_count())
            .field("tmp_paths", &self.temp_paths())
            .field("released", &self.is_closed())
            .finish()
    }
}
