//! VMDK hosted sparse extent decoding.
//!
//! This module reads monolithicSparse and streamOptimized extents: the
//! header and footer, the grain directory and grain tables, stream markers,
//! and the embedded descriptor. [`SparseExtent`] ties these together into a
//! `Read + Seek` over the virtual disk.

pub mod descriptor;
pub mod directory;
pub mod extent;
pub mod geometry;
pub mod header;
pub mod marker;

pub use descriptor::{parse_descriptor, Extent, ExtentType, VmdkDescriptor};
pub use directory::{read_grain_directory, read_grain_table, GrainDirectory};
pub use extent::{is_sparse_vmdk, GrainIndex, SparseExtent};
pub use geometry::GrainGeometry;
pub use header::{
    read_footer_if_gd_at_end, read_header_at, SparseExtentHeader, GD_AT_END, SECTOR_SIZE,
    VMDK_MAGIC,
};
pub use marker::{read_stream_marker, scan_stream_markers, MarkerType, StreamMarker, StreamScan};
