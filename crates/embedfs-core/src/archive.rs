//! TAR extraction into a fresh temporary directory.
//!
//! Every entry name is joined lexically under the extraction root and any
//! name that climbs out of it aborts the whole extraction. Only directories
//! and regular files are materialised; links and device nodes are skipped so
//! nothing written can point outside the root.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

use crate::config::ExtractOptions;
use crate::error::{Error, Result};
use crate::fs::{safe_join, DirFs, EmbeddedDirFs};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts a TAR (or gzip-compressed TAR) stream with default limits.
///
/// Returns the new temp directory. The caller owns it and must remove it.
pub fn tar_to_temp_dir<R: Read>(reader: R) -> Result<PathBuf> {
    tar_to_temp_dir_with(reader, &ExtractOptions::default())
}

/// Extracts a TAR stream with explicit limits.
///
/// On any error the partially written directory is removed before returning.
pub fn tar_to_temp_dir_with<R: Read>(reader: R, options: &ExtractOptions) -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(&options.temp_prefix)
        .tempdir()?;

    // `dir` removes itself if extraction fails.
    extract_into(reader, dir.path(), options)?;

    Ok(dir.keep())
}

/// Extracts a TAR stream and wraps the result as an [`EmbeddedDirFs`].
///
/// Closing the last handle deletes the extracted tree.
pub fn tar_to_embedded_fs<R: Read>(reader: R, options: &ExtractOptions) -> Result<EmbeddedDirFs> {
    let root = tar_to_temp_dir_with(reader, options)?;
    Ok(EmbeddedDirFs::new(
        Arc::new(DirFs::new(&root)),
        None,
        vec![root],
    ))
}

fn extract_into<R: Read>(reader: R, root: &Path, options: &ExtractOptions) -> Result<()> {
    let mut buffered = BufReader::new(reader);
    let gzip = buffered
        .fill_buf()
        .map_err(|e| Error::archive(format!("failed to read archive: {}", e)))?
        .starts_with(&GZIP_MAGIC);

    if gzip {
        debug!("archive is gzip compressed");
        unpack(&mut Archive::new(GzDecoder::new(buffered)), root, options)
    } else {
        unpack(&mut Archive::new(buffered), root, options)
    }
}

fn unpack<R: Read>(archive: &mut Archive<R>, root: &Path, options: &ExtractOptions) -> Result<()> {
    let read_failed = |e: io::Error| Error::archive(format!("failed to read archive: {}", e));

    let mut entries_seen = 0u64;
    let mut total_bytes = 0u64;
    let mut files = 0u64;

    for entry in archive.entries().map_err(read_failed)? {
        let mut entry = entry.map_err(read_failed)?;

        entries_seen += 1;
        if entries_seen > options.max_entries {
            return Err(Error::archive(format!(
                "archive has more than {} entries",
                options.max_entries
            )));
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let target = safe_join(root, Path::new(&name))?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| Error::io(e, &target))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry.size();
                if size > options.max_entry_bytes {
                    return Err(Error::archive(format!(
                        "entry '{}' is {} bytes, limit is {}",
                        name, size, options.max_entry_bytes
                    )));
                }
                total_bytes = total_bytes.saturating_add(size);
                if total_bytes > options.max_total_bytes {
                    return Err(Error::archive(format!(
                        "archive exceeds {} bytes of file data",
                        options.max_total_bytes
                    )));
                }

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
                }
                let mut out = File::create(&target).map_err(|e| Error::io(e, &target))?;
                let written = io::copy(&mut entry, &mut out)
                    .map_err(|e| Error::archive(format!("failed to extract '{}': {}", name, e)))?;
                if written != size {
                    return Err(Error::archive(format!(
                        "entry '{}' truncated: expected {} bytes, got {}",
                        name, size, written
                    )));
                }
                files += 1;
            }
            other => {
                debug!(entry = %name, kind = ?other, "skipping archive entry");
            }
        }
    }

    debug!(
        entries = entries_seen,
        files,
        bytes = total_bytes,
        root = %root.display(),
        "archive extracted"
    );
    Ok(())
}
