//! Grain directory and grain table decoding.

use std::io::{Read, Seek};

use crate::error::{Error, Result};
use crate::read::read_exact_at;

use super::geometry::{GrainGeometry, ENTRY_SIZE};
use super::header::{SparseExtentHeader, SECTOR_SIZE};

/// The grain directory: one grain table sector address per grain table.
///
/// A zero entry means the whole grain table is unallocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrainDirectory {
    entries: Vec<u32>,
}

impl GrainDirectory {
    /// Creates a directory from already decoded entries.
    pub fn from_entries(entries: Vec<u32>) -> Self {
        Self { entries }
    }

    /// Sector address of grain table `index`, or 0 if absent.
    pub fn table_sector(&self, index: u64) -> u32 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i).copied())
            .unwrap_or(0)
    }

    /// Decoded entries.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the directory holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::ops::Index<usize> for GrainDirectory {
    type Output = u32;

    fn index(&self, index: usize) -> &u32 {
        &self.entries[index]
    }
}

/// Reads the grain directory at `header.gd_offset`.
///
/// The whole `gd_sectors` span must be readable; trailing padding within the
/// last sector is ignored.
pub fn read_grain_directory<R: Read + Seek + ?Sized>(
    reader: &mut R,
    header: &SparseExtentHeader,
    geometry: &GrainGeometry,
) -> Result<GrainDirectory> {
    read_directory_at(reader, header.gd_offset, geometry, "grain directory")
}

/// Reads a grain directory at an explicit sector offset.
///
/// Used for both the primary and the redundant directory.
pub(crate) fn read_directory_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    gd_offset: u64,
    geometry: &GrainGeometry,
    what: &str,
) -> Result<GrainDirectory> {
    if gd_offset == 0 {
        return Err(Error::NoGrainDirectory);
    }

    let len = byte_len(geometry.gd_bytes())?;
    let offset = gd_offset
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| Error::vmdk(format!("{} offset {} overflows", what, gd_offset)))?;

    let mut buf = vec![0u8; len];
    read_exact_at(reader, offset, &mut buf, what)?;

    let count = byte_len(geometry.grain_tables)?.min(len / ENTRY_SIZE as usize);
    Ok(GrainDirectory {
        entries: decode_entries(&buf, count),
    })
}

/// Reads one grain table located at `gt_sector`.
pub fn read_grain_table<R: Read + Seek + ?Sized>(
    reader: &mut R,
    gt_sector: u32,
    geometry: &GrainGeometry,
) -> Result<Vec<u32>> {
    let len = byte_len(geometry.gt_bytes())?;
    let mut buf = vec![0u8; len];
    read_exact_at(
        reader,
        u64::from(gt_sector) * SECTOR_SIZE,
        &mut buf,
        "grain table",
    )?;
    let count = byte_len(geometry.gtes_per_gt)?.min(len / ENTRY_SIZE as usize);
    Ok(decode_entries(&buf, count))
}

fn decode_entries(buf: &[u8], count: usize) -> Vec<u32> {
    buf.chunks_exact(ENTRY_SIZE as usize)
        .take(count)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn byte_len(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::vmdk(format!("length {} exceeds platform limits", value)))
}
