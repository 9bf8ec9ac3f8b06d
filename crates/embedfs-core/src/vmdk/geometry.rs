//! Grain directory / grain table geometry derived from a header.

use crate::error::{Error, Result};

use super::header::{SparseExtentHeader, SECTOR_SIZE};
use super::marker::MAX_MARKER_PAYLOAD;

/// Size of one grain directory or grain table entry in bytes.
pub const ENTRY_SIZE: u64 = 4;

/// Largest grain accepted, in bytes. Matches the marker payload cap.
pub const MAX_GRAIN_BYTES: u64 = MAX_MARKER_PAYLOAD as u64;

/// Largest grain directory or single grain table accepted, in bytes.
pub const MAX_TABLE_BYTES: u64 = 64 * 1024 * 1024;

/// Geometry of the grain directory and grain tables of one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainGeometry {
    /// Number of grains (grain table entries in use) covering the capacity.
    pub grains: u64,
    /// Size in sectors of the final partial grain, 0 if the last grain is full.
    pub last_grain_sectors: u64,
    /// Number of grain tables.
    pub grain_tables: u64,
    /// Length of the grain directory in sectors.
    pub gd_sectors: u64,
    /// Length of one grain table in sectors.
    pub gt_sectors: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Grain table entries per grain table.
    pub gtes_per_gt: u64,
}

impl GrainGeometry {
    /// Computes the geometry for a header.
    ///
    /// Grain size and entries per grain table must be non-zero powers of two.
    /// Header values that overflow, or that would need a grain, grain table
    /// or grain directory larger than the caps above, are `InvalidGeometry`.
    pub fn from_header(header: &SparseExtentHeader) -> Result<Self> {
        if !header.grain_size.is_power_of_two() {
            return Err(Error::invalid_geometry(format!(
                "grain size {} is not a power of two",
                header.grain_size
            )));
        }
        if !header.num_gtes_per_gt.is_power_of_two() {
            return Err(Error::invalid_geometry(format!(
                "grain table entry count {} is not a power of two",
                header.num_gtes_per_gt
            )));
        }

        let grain_size = header.grain_size;
        let gtes_per_gt = u64::from(header.num_gtes_per_gt);

        let grain_bytes = checked_product(grain_size, SECTOR_SIZE, "grain size")?;
        if grain_bytes > MAX_GRAIN_BYTES {
            return Err(Error::invalid_geometry(format!(
                "grain of {} bytes exceeds limit of {}",
                grain_bytes, MAX_GRAIN_BYTES
            )));
        }
        checked_product(header.capacity, SECTOR_SIZE, "capacity")?;

        let full_grains = header.capacity / grain_size;
        let last_grain_sectors = header.capacity & (grain_size - 1);
        let grains = full_grains + u64::from(last_grain_sectors > 0);

        let grain_tables = grains.div_ceil(gtes_per_gt);
        let gd_bytes = checked_product(grain_tables, ENTRY_SIZE, "grain directory")?;
        let gt_bytes = checked_product(gtes_per_gt, ENTRY_SIZE, "grain table")?;
        for (what, bytes) in [("grain directory", gd_bytes), ("grain table", gt_bytes)] {
            if bytes > MAX_TABLE_BYTES {
                return Err(Error::invalid_geometry(format!(
                    "{} of {} bytes exceeds limit of {}",
                    what, bytes, MAX_TABLE_BYTES
                )));
            }
        }

        Ok(Self {
            grains,
            last_grain_sectors,
            grain_tables,
            gd_sectors: gd_bytes.div_ceil(SECTOR_SIZE),
            gt_sectors: gt_bytes.div_ceil(SECTOR_SIZE),
            grain_size,
            gtes_per_gt,
        })
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size.saturating_mul(SECTOR_SIZE)
    }

    /// Grain directory length in bytes.
    pub fn gd_bytes(&self) -> u64 {
        self.gd_sectors.saturating_mul(SECTOR_SIZE)
    }

    /// Grain table length in bytes.
    pub fn gt_bytes(&self) -> u64 {
        self.gt_sectors.saturating_mul(SECTOR_SIZE)
    }

    /// Splits a grain number into (grain table index, entry index).
    pub fn locate(&self, grain: u64) -> (u64, u64) {
        (grain / self.gtes_per_gt, grain % self.gtes_per_gt)
    }
}

fn checked_product(a: u64, b: u64, what: &str) -> Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::invalid_geometry(format!("{} overflows: {} * {}", what, a, b)))
}
