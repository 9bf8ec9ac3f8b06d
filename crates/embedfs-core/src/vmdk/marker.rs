//! Stream marker decoding for streamOptimized extents.
//!
//! A streamOptimized extent is a forward-only sequence of sector-aligned
//! records. Each record starts with a 12-byte head: an 8-byte value and a
//! 4-byte size. A non-zero size means a grain marker whose compressed payload
//! follows immediately; a zero size means a metadata marker whose 4-byte type
//! follows. Every record ends on a sector boundary.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::read::{align_up, read_full};

use super::header::{read_header_at, SparseExtentHeader, SECTOR_SIZE};

/// Length of the value + size head shared by every marker.
pub const MARKER_HEAD_LEN: usize = 12;

/// Upper bound on a grain marker payload (allocation guard).
pub const MAX_MARKER_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Marker types used in streamOptimized VMDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MarkerType {
    /// End of stream marker.
    EndOfStream = 0,
    /// Grain table marker.
    GrainTable = 1,
    /// Grain directory marker.
    GrainDirectory = 2,
    /// Footer marker.
    Footer = 3,
}

impl MarkerType {
    /// Maps a raw type tag to a marker type.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::EndOfStream),
            1 => Some(Self::GrainTable),
            2 => Some(Self::GrainDirectory),
            3 => Some(Self::Footer),
            _ => None,
        }
    }
}

/// A decoded stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMarker {
    /// Compressed grain for the logical sector `lba`.
    Grain { lba: u64, data: Vec<u8> },
    /// `sectors` sectors of grain table follow.
    GrainTable { sectors: u64 },
    /// `sectors` sectors of grain directory follow.
    GrainDirectory { sectors: u64 },
    /// `sectors` sectors of footer follow.
    Footer { sectors: u64 },
    /// End of the stream.
    EndOfStream,
}

impl StreamMarker {
    /// Raw value field.
    pub fn value(&self) -> u64 {
        match self {
            Self::Grain { lba, .. } => *lba,
            Self::GrainTable { sectors }
            | Self::GrainDirectory { sectors }
            | Self::Footer { sectors } => *sectors,
            Self::EndOfStream => 0,
        }
    }

    /// Raw size field (payload length, 0 for metadata markers).
    pub fn size(&self) -> u32 {
        match self {
            Self::Grain { data, .. } => data.len() as u32,
            _ => 0,
        }
    }

    /// Raw type field; grain markers carry no type and report 0.
    pub fn marker_type(&self) -> u32 {
        match self {
            Self::Grain { .. } | Self::EndOfStream => MarkerType::EndOfStream as u32,
            Self::GrainTable { .. } => MarkerType::GrainTable as u32,
            Self::GrainDirectory { .. } => MarkerType::GrainDirectory as u32,
            Self::Footer { .. } => MarkerType::Footer as u32,
        }
    }

    /// Inline payload of a grain marker.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Grain { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Head of a marker with the payload left unread.
#[derive(Debug, Clone, Copy)]
struct MarkerHead {
    offset: u64,
    value: u64,
    size: u32,
    marker_type: Option<MarkerType>,
}

fn read_marker_head<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<MarkerHead> {
    let offset = reader.stream_position()?;

    let mut head = [0u8; MARKER_HEAD_LEN];
    let n = read_full(reader, &mut head)?;
    if n < MARKER_HEAD_LEN {
        return Err(Error::short_read("stream marker", MARKER_HEAD_LEN, n));
    }
    let mut value = [0u8; 8];
    value.copy_from_slice(&head[0..8]);
    let value = u64::from_le_bytes(value);
    let size = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);

    if size > 0 {
        if size > MAX_MARKER_PAYLOAD {
            return Err(Error::vmdk(format!(
                "grain marker at offset {} claims {} bytes",
                offset, size
            )));
        }
        return Ok(MarkerHead {
            offset,
            value,
            size,
            marker_type: None,
        });
    }

    let mut raw_type = [0u8; 4];
    let n = read_full(reader, &mut raw_type)?;
    if n < raw_type.len() {
        return Err(Error::short_read("stream marker type", raw_type.len(), n));
    }
    let raw_type = u32::from_le_bytes(raw_type);
    let marker_type = MarkerType::from_u32(raw_type).ok_or(Error::InvalidMarker {
        marker_type: raw_type,
        offset,
    })?;

    Ok(MarkerHead {
        offset,
        value,
        size,
        marker_type: Some(marker_type),
    })
}

fn align_to_sector<R: Seek + ?Sized>(reader: &mut R) -> Result<u64> {
    let pos = reader.stream_position()?;
    let aligned = align_up(pos, SECTOR_SIZE);
    if aligned != pos {
        reader.seek(SeekFrom::Start(aligned))?;
    }
    Ok(aligned)
}

/// Reads one marker at the current position.
///
/// On success the reader is left on the next sector boundary.
pub fn read_stream_marker<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<StreamMarker> {
    let head = read_marker_head(reader)?;

    let marker = match head.marker_type {
        None => {
            let mut data = vec![0u8; head.size as usize];
            let n = read_full(reader, &mut data)?;
            if n < data.len() {
                return Err(Error::short_read("grain marker payload", data.len(), n));
            }
            StreamMarker::Grain {
                lba: head.value,
                data,
            }
        }
        Some(MarkerType::EndOfStream) => StreamMarker::EndOfStream,
        Some(MarkerType::GrainTable) => StreamMarker::GrainTable {
            sectors: head.value,
        },
        Some(MarkerType::GrainDirectory) => StreamMarker::GrainDirectory {
            sectors: head.value,
        },
        Some(MarkerType::Footer) => StreamMarker::Footer {
            sectors: head.value,
        },
    };

    align_to_sector(reader)?;
    Ok(marker)
}

/// Result of walking the markers of a streamOptimized extent.
#[derive(Debug, Clone, Default)]
pub struct StreamScan {
    /// Grain number to byte offset of its grain marker.
    pub grains: BTreeMap<u64, u64>,
    /// Sector offset of the grain directory body, if one was seen.
    pub gd_sector: Option<u64>,
    /// Footer header, if one was seen.
    pub footer: Option<SparseExtentHeader>,
    /// True if an end-of-stream marker terminated the walk.
    pub complete: bool,
}

/// Walks markers from `start` to end-of-stream, indexing grain markers.
///
/// Grain payloads are skipped, not read. A stream truncated before its
/// end-of-stream marker yields the grains seen so far with `complete` unset.
/// Callers decide whether a partial index is acceptable; `SparseExtent`
/// refuses one.
pub fn scan_stream_markers<R: Read + Seek + ?Sized>(
    reader: &mut R,
    start: u64,
    grain_size: u64,
) -> Result<StreamScan> {
    if grain_size == 0 {
        return Err(Error::invalid_geometry("grain size is zero"));
    }

    let mut scan = StreamScan::default();
    reader.seek(SeekFrom::Start(align_up(start, SECTOR_SIZE)))?;

    loop {
        let head = match read_marker_head(reader) {
            Ok(head) => head,
            Err(Error::ShortRead { .. }) => {
                warn!(grains = scan.grains.len(), "stream ended without end-of-stream marker");
                break;
            }
            Err(e) => return Err(e),
        };

        match head.marker_type {
            None => {
                scan.grains.insert(head.value / grain_size, head.offset);
                reader.seek(SeekFrom::Current(i64::from(head.size)))?;
                align_to_sector(reader)?;
            }
            Some(MarkerType::EndOfStream) => {
                scan.complete = true;
                break;
            }
            Some(kind) => {
                let body = align_to_sector(reader)?;
                match kind {
                    MarkerType::GrainDirectory => scan.gd_sector = Some(body / SECTOR_SIZE),
                    MarkerType::Footer => scan.footer = Some(read_header_at(reader, body)?),
                    _ => {}
                }
                let skip = head
                    .value
                    .checked_mul(SECTOR_SIZE)
                    .and_then(|len| body.checked_add(len))
                    .ok_or_else(|| {
                        Error::vmdk(format!("marker at offset {} overflows", head.offset))
                    })?;
                reader.seek(SeekFrom::Start(skip))?;
            }
        }
    }

    debug!(
        grains = scan.grains.len(),
        complete = scan.complete,
        "scanned stream markers"
    );
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn metadata_marker(value: u64, marker_type: MarkerType) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(&value.to_le_bytes());
        buf[12..16].copy_from_slice(&(marker_type as u32).to_le_bytes());
        buf
    }

    fn grain_marker(lba: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&lba.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.resize(align_up(buf.len() as u64, SECTOR_SIZE) as usize, 0);
        buf
    }

    #[test]
    fn test_marker_type_from_u32() {
        assert_eq!(MarkerType::from_u32(2), Some(MarkerType::GrainDirectory));
        assert_eq!(MarkerType::from_u32(9), None);
    }

    #[test]
    fn test_unknown_marker_type() {
        let mut data = metadata_marker(1, MarkerType::Footer);
        data[12..16].copy_from_slice(&7u32.to_le_bytes());
        let err = read_stream_marker(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidMarker {
                marker_type: 7,
                offset: 0
            }
        ));
    }

    #[test]
    fn test_grain_payload_spanning_sectors() {
        let payload = vec![0x5Au8; 700];
        let mut data = grain_marker(256, &payload);
        data.extend(metadata_marker(0, MarkerType::EndOfStream));
        let mut cursor = Cursor::new(data);

        let marker = read_stream_marker(&mut cursor).unwrap();
        assert_eq!(marker.payload(), Some(&payload[..]));
        assert_eq!(cursor.position(), 1024);
        assert_eq!(read_stream_marker(&mut cursor).unwrap(), StreamMarker::EndOfStream);
    }

    #[test]
    fn test_truncated_payload() {
        let mut data = grain_marker(0, b"abcdef");
        data.truncate(14);
        let err = read_stream_marker(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut data = vec![0u8; 512];
        data[8..12].copy_from_slice(&(MAX_MARKER_PAYLOAD + 1).to_le_bytes());
        assert!(matches!(
            read_stream_marker(&mut Cursor::new(data)),
            Err(Error::Vmdk { .. })
        ));
    }

    #[test]
    fn test_scan_indexes_grains_and_metadata() {
        let mut data = vec![0u8; 512]; // header sector
        data.extend(grain_marker(0, b"first"));
        data.extend(grain_marker(256, b"third"));
        data.extend(metadata_marker(1, MarkerType::GrainDirectory));
        data.extend(vec![0u8; 512]);
        data.extend(metadata_marker(0, MarkerType::EndOfStream));

        let scan = scan_stream_markers(&mut Cursor::new(data), 512, 128).unwrap();
        assert!(scan.complete);
        assert_eq!(scan.grains.get(&0), Some(&512));
        assert_eq!(scan.grains.get(&2), Some(&1024));
        assert_eq!(scan.gd_sector, Some(4));
        assert!(scan.footer.is_none());
    }

    #[test]
    fn test_scan_truncated_stream() {
        let mut data = vec![0u8; 512];
        data.extend(grain_marker(128, b"only"));
        let scan = scan_stream_markers(&mut Cursor::new(data), 512, 128).unwrap();
        assert!(!scan.complete);
        assert_eq!(scan.grains.len(), 1);
        assert_eq!(scan.grains.get(&1), Some(&512));
    }
}
