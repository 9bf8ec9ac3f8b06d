//! Filesystem driver dispatch.
//!
//! Detection ([`crate::detect`]) only names a [`FilesystemKind`]; the
//! [`DriverRegistry`] maps that kind to whatever driver the caller plugged
//! in. Adding a signature never touches the drivers and vice versa.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::detect::{detect_filesystem, FilesystemKind};
use crate::error::{Error, Result};
use crate::fs::{DirEntry, FsView};

/// A filesystem opened by a driver.
pub struct MountedView {
    pub view: Arc<dyn FsView>,
    /// Scratch paths the driver created, removed with the mount.
    pub tmp_paths: Vec<PathBuf>,
}

/// Opens one filesystem family inside a raw image.
pub trait FilesystemDriver: Send + Sync {
    /// The filesystem family this driver reads.
    fn kind(&self) -> FilesystemKind;

    /// Opens the filesystem starting `offset` bytes into `image`.
    fn mount(&self, image: &Path, offset: u64) -> Result<MountedView>;
}

/// Drivers keyed by filesystem kind.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<FilesystemKind, Arc<dyn FilesystemDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` under its kind, returning any driver it replaces.
    pub fn register(
        &mut self,
        driver: Arc<dyn FilesystemDriver>,
    ) -> Option<Arc<dyn FilesystemDriver>> {
        self.drivers.insert(driver.kind(), driver)
    }

    pub fn get(&self, kind: FilesystemKind) -> Option<&Arc<dyn FilesystemDriver>> {
        self.drivers.get(&kind)
    }

    /// Kinds with a registered driver.
    pub fn kinds(&self) -> Vec<FilesystemKind> {
        self.drivers.keys().copied().collect()
    }

    /// Mounts with the driver registered for `kind`.
    pub fn mount(&self, kind: FilesystemKind, image: &Path, offset: u64) -> Result<MountedView> {
        let driver = self.get(kind).ok_or_else(|| Error::UnsupportedFilesystem {
            kind: kind.label().to_string(),
        })?;
        debug!(kind = %kind, offset, image = %image.display(), "mounting filesystem");
        driver.mount(image, offset)
    }

    /// Detects the filesystem at `offset` and mounts it.
    pub fn detect_and_mount(
        &self,
        image: &Path,
        offset: u64,
    ) -> Result<(FilesystemKind, MountedView)> {
        let mut file = File::open(image).map_err(|e| Error::io(e, image))?;
        let kind = detect_filesystem(&mut file, offset)?;
        drop(file);
        let mounted = self.mount(kind, image, offset)?;
        Ok((kind, mounted))
    }
}

/// Drops the bookkeeping entries a filesystem exposes in listings.
///
/// Always drops empty names, `.` and `..`. ext and FAT also drop
/// `lost+found`; NTFS drops `$`-prefixed metafiles.
pub fn filter_system_entries(kind: FilesystemKind, entries: Vec<DirEntry>) -> Vec<DirEntry> {
    entries
        .into_iter()
        .filter(|entry| {
            let name = entry.name.as_str();
            if name.is_empty() || name == "." || name == ".." {
                return false;
            }
            match kind {
                FilesystemKind::Ext | FilesystemKind::Fat32 => name != "lost+found",
                FilesystemKind::Ntfs => !name.starts_with('$'),
                FilesystemKind::ExFat | FilesystemKind::Unknown => true,
            }
        })
        .collect()
}
