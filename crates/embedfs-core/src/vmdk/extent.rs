//! Virtual block reader over a hosted sparse extent.
//!
//! [`SparseExtent`] resolves virtual byte offsets through the grain directory
//! and grain tables (or, for streamOptimized extents without a usable
//! directory, through an index built by walking the stream markers) and
//! exposes the result as a `Read + Seek` over the virtual disk.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::{DeflateDecoder, ZlibDecoder};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::read::{read_exact_at, read_full};

use super::descriptor::{parse_embedded_descriptor, VmdkDescriptor};
use super::directory::{read_directory_at, read_grain_table, GrainDirectory};
use super::geometry::GrainGeometry;
use super::header::{
    read_footer_if_gd_at_end, read_header_at, SparseExtentHeader, COMPRESS_DEFLATE,
    COMPRESS_NONE, FLAG_ZEROED_GTE, SECTOR_SIZE,
};
use super::marker::{read_stream_marker, scan_stream_markers, StreamMarker};

/// Highest sparse extent version understood.
pub const MAX_SUPPORTED_VERSION: u32 = 3;

/// Upper bound on the embedded descriptor size in sectors.
const MAX_DESCRIPTOR_SECTORS: u64 = 2048;

/// Where grain locations come from.
#[derive(Debug, Clone)]
pub enum GrainIndex {
    /// Grain directory, resolved through grain tables on demand.
    Directory(GrainDirectory),
    /// Grain number to grain marker byte offset, from a marker walk.
    Scanned(BTreeMap<u64, u64>),
}

/// A reader for the virtual disk stored in one sparse extent.
pub struct SparseExtent<R> {
    reader: R,
    header: SparseExtentHeader,
    geometry: GrainGeometry,
    index: GrainIndex,
    /// Grain tables already read, keyed by grain table index.
    tables: HashMap<u64, Vec<u32>>,
    /// Most recently decoded grain.
    cached_grain: Option<(u64, Vec<u8>)>,
    position: u64,
}

impl SparseExtent<File> {
    /// Opens a sparse extent file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(file)
    }
}

impl<R: Read + Seek> SparseExtent<R> {
    /// Decodes the header, footer, geometry and grain index of an extent.
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = read_header_at(&mut reader, 0)?;
        read_footer_if_gd_at_end(&mut reader, &mut header)?;

        if header.version == 0 || header.version > MAX_SUPPORTED_VERSION {
            return Err(Error::vmdk(format!(
                "unsupported sparse extent version: {}",
                header.version
            )));
        }
        if header.is_compressed()
            && header.compress_algorithm != COMPRESS_DEFLATE
            && header.compress_algorithm != COMPRESS_NONE
        {
            return Err(Error::vmdk(format!(
                "unsupported compression algorithm: {}",
                header.compress_algorithm
            )));
        }

        let geometry = GrainGeometry::from_header(&header)?;
        let index = Self::build_index(&mut reader, &header, &geometry)?;

        debug!(
            version = header.version,
            capacity = header.capacity,
            grain_size = header.grain_size,
            grains = geometry.grains,
            compressed = header.is_compressed(),
            "opened sparse extent"
        );

        Ok(Self {
            reader,
            header,
            geometry,
            index,
            tables: HashMap::new(),
            cached_grain: None,
            position: 0,
        })
    }

    fn build_index(
        reader: &mut R,
        header: &SparseExtentHeader,
        geometry: &GrainGeometry,
    ) -> Result<GrainIndex> {
        let primary = if header.gd_at_end() {
            Err(Error::NoGrainDirectory)
        } else {
            read_directory_at(reader, header.gd_offset, geometry, "grain directory")
        };

        let primary_err = match primary {
            Ok(gd) => return Ok(GrainIndex::Directory(gd)),
            Err(e) => e,
        };

        if header.rgd_offset != 0 && header.rgd_offset != header.gd_offset {
            match read_directory_at(
                reader,
                header.rgd_offset,
                geometry,
                "redundant grain directory",
            ) {
                Ok(gd) => {
                    warn!(error = %primary_err, "using redundant grain directory");
                    return Ok(GrainIndex::Directory(gd));
                }
                Err(e) => debug!(error = %e, "redundant grain directory unusable"),
            }
        }

        if header.has_markers() {
            let start = header
                .descriptor_offset
                .checked_add(header.descriptor_size)
                .map(|end| end.max(header.overhead).max(1))
                .and_then(|sector| sector.checked_mul(SECTOR_SIZE))
                .ok_or_else(|| {
                    Error::invalid_geometry(format!(
                        "marker scan start overflows: descriptor {}+{}, overhead {}",
                        header.descriptor_offset, header.descriptor_size, header.overhead
                    ))
                })?;
            let scan = scan_stream_markers(reader, start, header.grain_size)?;
            if !scan.complete {
                return Err(Error::vmdk(format!(
                    "stream truncated before end-of-stream marker after {} grains",
                    scan.grains.len()
                )));
            }
            return Ok(GrainIndex::Scanned(scan.grains));
        }

        Err(primary_err)
    }

    /// The authoritative header (the footer when one superseded it).
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Derived grain geometry.
    pub fn geometry(&self) -> &GrainGeometry {
        &self.geometry
    }

    /// How grains are located.
    pub fn index(&self) -> &GrainIndex {
        &self.index
    }

    /// Virtual disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity_bytes()
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.geometry.grain_size_bytes()
    }

    /// Reads the embedded descriptor, if the extent has one.
    pub fn descriptor(&mut self) -> Result<Option<VmdkDescriptor>> {
        if self.header.descriptor_offset == 0 || self.header.descriptor_size == 0 {
            return Ok(None);
        }
        if self.header.descriptor_size > MAX_DESCRIPTOR_SECTORS {
            return Err(Error::vmdk(format!(
                "descriptor of {} sectors exceeds limit",
                self.header.descriptor_size
            )));
        }
        let offset = self
            .header
            .descriptor_offset
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| {
                Error::vmdk(format!(
                    "descriptor offset {} overflows",
                    self.header.descriptor_offset
                ))
            })?;
        let mut region = vec![0u8; (self.header.descriptor_size * SECTOR_SIZE) as usize];
        read_exact_at(&mut self.reader, offset, &mut region, "embedded descriptor")?;
        parse_embedded_descriptor(&region).map(Some)
    }

    /// Consumes the extent, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Byte offset of the data for `grain`, or None if the grain is sparse.
    fn locate_grain(&mut self, grain: u64) -> Result<Option<u64>> {
        let gt_sector = match &self.index {
            GrainIndex::Scanned(grains) => return Ok(grains.get(&grain).copied()),
            GrainIndex::Directory(gd) => {
                let (gt_index, _) = self.geometry.locate(grain);
                gd.table_sector(gt_index)
            }
        };
        if gt_sector == 0 {
            return Ok(None);
        }

        let (gt_index, gte_index) = self.geometry.locate(grain);
        if !self.tables.contains_key(&gt_index) {
            let table = read_grain_table(&mut self.reader, gt_sector, &self.geometry)?;
            self.tables.insert(gt_index, table);
        }
        let entry = self
            .tables
            .get(&gt_index)
            .and_then(|t| t.get(gte_index as usize))
            .copied()
            .unwrap_or(0);

        let zeroed = entry == 1 && (self.header.flags & FLAG_ZEROED_GTE) != 0;
        if entry == 0 || zeroed {
            return Ok(None);
        }
        Ok(Some(u64::from(entry) * SECTOR_SIZE))
    }

    /// Length in bytes of `grain`, shorter than a full grain only for the last one.
    fn grain_len(&self, grain: u64) -> usize {
        let full = self.grain_size_bytes();
        let start = grain.saturating_mul(full);
        full.min(self.capacity().saturating_sub(start)) as usize
    }

    /// Reads and, if needed, inflates one grain.
    fn load_grain(&mut self, grain: u64, offset: u64) -> Result<Vec<u8>> {
        let len = self.grain_len(grain);
        let compressed = self.header.is_compressed() || self.header.has_markers();

        if !compressed {
            let mut data = vec![0u8; len];
            read_exact_at(&mut self.reader, offset, &mut data, "grain")?;
            return Ok(data);
        }

        self.reader.seek(SeekFrom::Start(offset))?;
        let payload = match read_stream_marker(&mut self.reader)? {
            StreamMarker::Grain { data, .. } => data,
            other => {
                return Err(Error::vmdk(format!(
                    "expected grain marker at offset {}, found type {}",
                    offset,
                    other.marker_type()
                )))
            }
        };
        inflate_grain(&payload, len)
    }

    /// Reads virtual disk bytes at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, 0 at or past the capacity.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let capacity = self.capacity();
        if offset >= capacity || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(capacity - offset) as usize;
        let grain_bytes = self.grain_size_bytes();

        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let grain = pos / grain_bytes;
            let within = (pos % grain_bytes) as usize;
            let take = (want - done).min(grain_bytes as usize - within);
            let out = &mut buf[done..done + take];

            let hit = matches!(&self.cached_grain, Some((g, _)) if *g == grain);
            if !hit {
                match self.locate_grain(grain)? {
                    None => {
                        out.fill(0);
                        done += take;
                        continue;
                    }
                    Some(data_offset) => {
                        let data = self.load_grain(grain, data_offset)?;
                        self.cached_grain = Some((grain, data));
                    }
                }
            }

            if let Some((_, data)) = &self.cached_grain {
                let available = data.len().saturating_sub(within).min(take);
                out[..available].copy_from_slice(&data[within..within + available]);
                out[available..].fill(0);
            }
            done += take;
        }

        Ok(done)
    }
}

/// Inflates a compressed grain payload to exactly `len` bytes.
///
/// VMware writes zlib streams; raw DEFLATE is accepted too. Output shorter
/// than `len` is zero-filled.
fn inflate_grain(payload: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    let limit = len as u64;
    let result = if is_zlib_header(payload) {
        ZlibDecoder::new(payload).take(limit).read_to_end(&mut data)
    } else {
        DeflateDecoder::new(payload).take(limit).read_to_end(&mut data)
    };
    result.map_err(|e| Error::vmdk(format!("failed to decompress grain: {}", e)))?;
    data.resize(len, 0);
    Ok(data)
}

fn is_zlib_header(payload: &[u8]) -> bool {
    match payload {
        [cmf, flg, ..] => cmf & 0x0F == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

impl<R: Read + Seek> Read for SparseExtent<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SparseExtent<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.capacity().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

/// Check if a file starts with the sparse extent magic.
pub fn is_sparse_vmdk(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut magic = [0u8; 4];
    let n = read_full(&mut file, &mut magic)?;
    Ok(n == magic.len() && u32::from_le_bytes(magic) == super::header::VMDK_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_inflate_zlib_and_raw_deflate() {
        let grain = vec![0x11u8; 4096];

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&grain).unwrap();
        let zlib = zlib.finish().unwrap();
        assert!(is_zlib_header(&zlib));
        assert_eq!(inflate_grain(&zlib, 4096).unwrap(), grain);

        let mut raw = DeflateEncoder::new(Vec::new(), Compression::default());
        raw.write_all(&grain).unwrap();
        let raw = raw.finish().unwrap();
        assert_eq!(inflate_grain(&raw, 4096).unwrap(), grain);
    }

    #[test]
    fn test_inflate_zero_fills_short_output() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&[7u8; 100]).unwrap();
        let zlib = zlib.finish().unwrap();
        let data = inflate_grain(&zlib, 512).unwrap();
        assert_eq!(&data[..100], &[7u8; 100][..]);
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_inflate_garbage_fails() {
        assert!(inflate_grain(&[0x78, 0x9c, 0xff, 0xff, 0xff], 512).is_err());
    }
}
