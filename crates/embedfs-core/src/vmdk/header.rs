//! Sparse extent header and footer.
//!
//! Every hosted sparse extent starts with a 512-byte header. When the grain
//! directory was written after the grains (streamed or appended output), the
//! leading header carries [`GD_AT_END`] and a copy with the real offsets sits
//! in the second-to-last sector of the file. That footer supersedes the
//! leading header.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::error::{Error, Result};
use crate::read::read_exact_at;

/// VMDK magic number ("KDMV" on disk, little-endian u32).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Grain directory offset value indicating the GD is at the end of the file.
pub const GD_AT_END: u64 = 0xFFFFFFFFFFFFFFFF;

/// Size of the trailing block holding footer marker, footer and end-of-stream marker.
pub const FOOTER_BLOCK_SIZE: u64 = 3 * SECTOR_SIZE;

/// Newline detection bytes are valid.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
/// A redundant grain directory is maintained.
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
/// Grain table entry value 1 denotes a zeroed grain.
pub const FLAG_ZEROED_GTE: u32 = 1 << 2;
/// Grains are compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 16;
/// The extent contains stream markers.
pub const FLAG_MARKERS: u32 = 1 << 17;

/// Compression algorithm: none.
pub const COMPRESS_NONE: u16 = 0;
/// Compression algorithm: DEFLATE.
pub const COMPRESS_DEFLATE: u16 = 1;

const HEADER_LEN: usize = SECTOR_SIZE as usize;
const RESERVED_OFFSET: usize = 79;
const RESERVED_LEN: usize = HEADER_LEN - RESERVED_OFFSET;

/// Sparse extent header for VMDK files.
///
/// This is a 512-byte structure at the start of the extent, and optionally
/// repeated as a footer near its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    /// Magic number (VMDK_MAGIC).
    pub magic: u32,
    /// Version (1, 2 or 3; 3 for streamOptimized).
    pub version: u32,
    /// Flags.
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Descriptor offset in sectors.
    pub descriptor_offset: u64,
    /// Descriptor size in sectors.
    pub descriptor_size: u64,
    /// Number of grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Grain directory offset in sectors, or [`GD_AT_END`].
    pub gd_offset: u64,
    /// Overhead in sectors.
    pub overhead: u64,
    /// Unclean shutdown flag.
    pub unclean_shutdown: u8,
    /// Newline detection characters.
    pub newline_chars: [u8; 4],
    /// Compression algorithm (1 = DEFLATE).
    pub compress_algorithm: u16,
    /// Padding up to the sector boundary, kept verbatim.
    pub reserved: [u8; RESERVED_LEN],
}

impl Default for SparseExtentHeader {
    fn default() -> Self {
        Self {
            magic: 0,
            version: 0,
            flags: 0,
            capacity: 0,
            grain_size: 0,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: 0,
            rgd_offset: 0,
            gd_offset: 0,
            overhead: 0,
            unclean_shutdown: 0,
            newline_chars: [0; 4],
            compress_algorithm: 0,
            reserved: [0; RESERVED_LEN],
        }
    }
}

impl SparseExtentHeader {
    /// Parse a header from one sector of bytes.
    ///
    /// The magic number is checked before anything else is decoded.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::short_read(
                "sparse extent header",
                HEADER_LEN,
                data.len(),
            ));
        }

        let magic = le_u32(data, 0);
        if magic != VMDK_MAGIC {
            return Err(Error::InvalidMagic {
                expected: VMDK_MAGIC,
                found: magic,
            });
        }

        let mut reserved = [0u8; RESERVED_LEN];
        reserved.copy_from_slice(&data[RESERVED_OFFSET..HEADER_LEN]);

        Ok(Self {
            magic,
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            num_gtes_per_gt: le_u32(data, 44),
            rgd_offset: le_u64(data, 48),
            gd_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            unclean_shutdown: data[72],
            newline_chars: [data[73], data[74], data[75], data[76]],
            compress_algorithm: u16::from_le_bytes([data[77], data[78]]),
            reserved,
        })
    }

    /// Serializes the header to exactly 512 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];

        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        buf[72] = self.unclean_shutdown;
        buf[73..77].copy_from_slice(&self.newline_chars);
        buf[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        buf[RESERVED_OFFSET..].copy_from_slice(&self.reserved);

        buf
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if this is a streamOptimized extent with markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Check if the grain directory was relocated to the end of the file.
    pub fn gd_at_end(&self) -> bool {
        self.gd_offset == GD_AT_END
    }

    /// Capacity of the virtual disk in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.saturating_mul(SECTOR_SIZE)
    }
}

/// Reads and validates one header record at `offset`.
pub fn read_header_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
) -> Result<SparseExtentHeader> {
    let mut buf = [0u8; HEADER_LEN];
    read_exact_at(reader, offset, &mut buf, "sparse extent header")?;
    SparseExtentHeader::from_bytes(&buf)
}

/// Replaces `header` with the footer when the grain directory is at the end.
///
/// A no-op unless `header.gd_offset` is [`GD_AT_END`]. The footer lives one
/// sector into the trailing three-sector block, so the file must be at least
/// [`FOOTER_BLOCK_SIZE`] bytes long.
pub fn read_footer_if_gd_at_end<R: Read + Seek + ?Sized>(
    reader: &mut R,
    header: &mut SparseExtentHeader,
) -> Result<()> {
    if !header.gd_at_end() {
        return Ok(());
    }

    let size = reader.seek(SeekFrom::End(0))?;
    if size < FOOTER_BLOCK_SIZE {
        return Err(Error::TooSmall {
            size,
            minimum: FOOTER_BLOCK_SIZE,
        });
    }

    let footer_offset = size - FOOTER_BLOCK_SIZE + SECTOR_SIZE;
    let footer = read_header_at(reader, footer_offset)?;
    debug!(
        footer_offset,
        gd_offset = footer.gd_offset,
        "grain directory relocated, using footer"
    );
    *header = footer;
    Ok(())
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}
