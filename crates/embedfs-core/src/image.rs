//! Disk image orchestration.
//!
//! Ties the decoder, detector and drivers together:
//! 1. Decode a sparse extent and stream its virtual disk to a raw temp file
//! 2. Find the volumes (whole disk or MBR/GPT partitions) and sniff their filesystems
//! 3. Mount it through the registered driver and wrap it as an [`EmbeddedDirFs`]
//!
//! # Example
//!
//! ```no_run
//! use embedfs_core::{mount_vmdk, DriverRegistry, ExtractOptions};
//! use std::path::Path;
//!
//! let registry = DriverRegistry::new();
//! let fs = mount_vmdk(Path::new("/path/to/disk.vmdk"), &registry, &ExtractOptions::default())
//!     .unwrap();
//! for entry in fs.read_dir("/").unwrap() {
//!     println!("{}", entry.name);
//! }
//! fs.close().unwrap();
//! ```

use std::io::{Read, Seek, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::ExtractOptions;
use crate::detect::FilesystemKind;
use crate::driver::{filter_system_entries, DriverRegistry};
use crate::error::{Error, Result};
use crate::fs::EmbeddedDirFs;
use crate::partition::{probe_volumes, Volume};
use crate::vmdk::{GrainIndex, SparseExtent};

/// Progress of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertProgress {
    /// Virtual disk bytes written so far.
    pub bytes_processed: u64,
    /// Virtual disk capacity.
    pub bytes_total: u64,
}

impl ConvertProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ConvertProgress) + Send>;

/// Outcome of a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertSummary {
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the raw image.
    pub sha256: String,
}

/// A virtual disk written out to a temporary raw file.
#[derive(Debug)]
pub struct ExtractedImage {
    /// Deleted when dropped or closed.
    pub file: NamedTempFile,
    pub summary: ConvertSummary,
}

/// Summary information about a sparse extent.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub version: u32,
    pub capacity_bytes: u64,
    pub grain_size_bytes: u64,
    pub grains: u64,
    pub grain_tables: u64,
    pub compressed: bool,
    pub has_markers: bool,
    /// True if grains were located by walking stream markers.
    pub scanned: bool,
    /// createType from the embedded descriptor, if any.
    pub create_type: Option<String>,
    /// True if the descriptor names a parent disk.
    pub has_parent: bool,
}

/// Reads header, geometry and descriptor details without converting.
pub fn inspect_vmdk(path: &Path) -> Result<DiskInfo> {
    let mut extent = SparseExtent::open(path)?;
    let descriptor = match extent.descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable embedded descriptor");
            None
        }
    };

    let header = extent.header();
    let geometry = extent.geometry();
    Ok(DiskInfo {
        version: header.version,
        capacity_bytes: header.capacity_bytes(),
        grain_size_bytes: geometry.grain_size_bytes(),
        grains: geometry.grains,
        grain_tables: geometry.grain_tables,
        compressed: header.is_compressed(),
        has_markers: header.has_markers(),
        scanned: matches!(extent.index(), GrainIndex::Scanned(_)),
        create_type: descriptor.as_ref().map(|d| d.create_type.clone()),
        has_parent: descriptor.as_ref().is_some_and(|d| d.has_parent()),
    })
}

/// Streams the whole virtual disk of `extent` to `writer`.
///
/// Unallocated grains are written as zeros, so the output is exactly
/// `extent.capacity()` bytes.
pub fn convert_to_raw<R, W>(
    extent: &mut SparseExtent<R>,
    writer: &mut W,
    chunk_size: usize,
    progress_callback: Option<&ProgressCallback>,
) -> Result<ConvertSummary>
where
    R: Read + Seek,
    W: Write + ?Sized,
{
    let total = extent.capacity();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut offset = 0u64;

    while offset < total {
        let n = extent.read_at(offset, &mut buffer)?;
        if n == 0 {
            return Err(truncated_disk(total, offset));
        }
        writer.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
        offset += n as u64;

        if let Some(callback) = progress_callback {
            callback(ConvertProgress {
                bytes_processed: offset,
                bytes_total: total,
            });
        }
    }
    writer.flush()?;

    Ok(ConvertSummary {
        bytes_written: offset,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// Converts a sparse extent to a raw temp file.
///
/// Child disks are refused: their unallocated grains live in a parent that
/// is not available here.
pub fn extract_vmdk_to_temp(
    path: &Path,
    options: &ExtractOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ExtractedImage> {
    let mut extent = SparseExtent::open(path)?;
    match extent.descriptor() {
        Ok(Some(descriptor)) if descriptor.has_parent() => {
            return Err(Error::vmdk(format!(
                "{} is a child disk (parentCID {:08x})",
                path.display(),
                descriptor.parent_cid
            )));
        }
        Ok(_) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable embedded descriptor"),
    }

    let mut file = tempfile::Builder::new()
        .prefix(&options.temp_prefix)
        .suffix(".raw")
        .tempfile()?;
    let summary = convert_to_raw(
        &mut extent,
        file.as_file_mut(),
        options.effective_chunk_size(),
        progress_callback.as_ref(),
    )?;

    debug!(
        source = %path.display(),
        raw = %file.path().display(),
        bytes = summary.bytes_written,
        "converted sparse extent to raw image"
    );
    Ok(ExtractedImage { file, summary })
}

/// Converts a sparse extent, finds a filesystem and mounts it.
///
/// Volumes come from [`probe_volumes`]: the whole disk when a filesystem
/// starts at offset 0, otherwise each MBR or GPT partition. The first volume
/// whose filesystem has a registered driver is mounted. The returned handle
/// owns the raw image; closing its last reference deletes it along with any
/// scratch paths of the driver.
pub fn mount_vmdk(
    path: &Path,
    registry: &DriverRegistry,
    options: &ExtractOptions,
) -> Result<EmbeddedDirFs> {
    let image = extract_vmdk_to_temp(path, options, None)?;
    let raw_path = image.file.path().to_path_buf();

    let volumes = {
        let mut raw = image.file.reopen().map_err(|e| Error::io(e, &raw_path))?;
        probe_volumes(&mut raw)?
    };
    let volume = select_volume(&volumes, registry)?;
    let mounted = registry.mount(volume.kind, &raw_path, volume.offset)?;
    debug!(
        kind = %volume.kind,
        offset = volume.offset,
        raw = %raw_path.display(),
        "mounted embedded filesystem"
    );

    let kind = volume.kind;
    let mut tmp_paths = vec![raw_path];
    tmp_paths.extend(mounted.tmp_paths);

    Ok(
        EmbeddedDirFs::new(mounted.view, Some(Box::new(image.file)), tmp_paths)
            .with_entry_filter(move |entries| filter_system_entries(kind, entries)),
    )
}

/// Picks the first volume a registered driver can read.
///
/// Fails with `UnsupportedFilesystem` naming the first recognised kind, or
/// "unknown" when no volume carries a known signature.
fn select_volume<'a>(volumes: &'a [Volume], registry: &DriverRegistry) -> Result<&'a Volume> {
    if let Some(volume) = volumes
        .iter()
        .find(|v| v.kind != FilesystemKind::Unknown && registry.get(v.kind).is_some())
    {
        return Ok(volume);
    }
    let kind = volumes
        .iter()
        .map(|v| v.kind)
        .find(|&k| k != FilesystemKind::Unknown)
        .unwrap_or(FilesystemKind::Unknown);
    Err(Error::UnsupportedFilesystem {
        kind: kind.label().to_string(),
    })
}

/// The error for a virtual disk that stopped yielding bytes before its
/// capacity.
fn truncated_disk(total: u64, offset: u64) -> Error {
    Error::vmdk(format!(
        "virtual disk ended at byte {} of {} ({} bytes missing)",
        offset,
        total,
        total - offset
    ))
}
