//! Fixture builders for sparse extent tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

use embedfs_core::vmdk::header::{
    SparseExtentHeader, COMPRESS_DEFLATE, FLAG_COMPRESSED, FLAG_MARKERS, FLAG_REDUNDANT_GRAIN_TABLE,
    FLAG_VALID_NEWLINE, FLAG_ZEROED_GTE, GD_AT_END, SECTOR_SIZE, VMDK_MAGIC,
};
use embedfs_core::vmdk::marker::MarkerType;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

pub const SECTOR: usize = SECTOR_SIZE as usize;

pub fn base_header(capacity: u64, grain_size: u64, gtes: u32) -> SparseExtentHeader {
    SparseExtentHeader {
        magic: VMDK_MAGIC,
        version: 1,
        flags: FLAG_VALID_NEWLINE,
        capacity,
        grain_size,
        num_gtes_per_gt: gtes,
        newline_chars: [b'\n', b' ', b'\r', b'\n'],
        ..Default::default()
    }
}

/// Repeating pattern unique to each grain.
pub fn grain_pattern(grain: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (grain as usize * 31 + i) as u8)
        .collect()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("compress grain");
    encoder.finish().expect("finish compression")
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let rem = buf.len() % SECTOR;
    if rem != 0 {
        buf.resize(buf.len() + SECTOR - rem, 0);
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

fn entries_to_bytes(entries: &[u32], sectors: u64) -> Vec<u8> {
    let mut bytes: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
    bytes.resize((sectors * SECTOR_SIZE) as usize, 0);
    bytes
}

/// Builds monolithicSparse extents with uncompressed grains.
pub struct HostedSparseBuilder {
    capacity: u64,
    grain_size: u64,
    gtes: u32,
    grains: BTreeMap<u64, Vec<u8>>,
    zeroed: Vec<u64>,
    descriptor: Option<String>,
    redundant: bool,
    break_primary_gd: bool,
    version: u32,
}

impl HostedSparseBuilder {
    pub fn new(capacity: u64, grain_size: u64, gtes: u32) -> Self {
        Self {
            capacity,
            grain_size,
            gtes,
            grains: BTreeMap::new(),
            zeroed: Vec::new(),
            descriptor: None,
            redundant: false,
            break_primary_gd: false,
            version: 1,
        }
    }

    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        self.grains.insert(index, data);
        self
    }

    /// Marks the grain table entry as the "zeroed grain" value 1.
    pub fn zeroed_grain(mut self, index: u64) -> Self {
        self.zeroed.push(index);
        self
    }

    pub fn descriptor(mut self, text: &str) -> Self {
        self.descriptor = Some(text.to_string());
        self
    }

    pub fn redundant(mut self) -> Self {
        self.redundant = true;
        self
    }

    /// Points the primary grain directory past the end of the file.
    pub fn break_primary_gd(mut self) -> Self {
        self.break_primary_gd = true;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let grain_bytes = self.grain_size * SECTOR_SIZE;
        let gtes = u64::from(self.gtes);
        let grains = ceil_div(self.capacity, self.grain_size);
        let tables = ceil_div(grains, gtes);
        let gd_sectors = ceil_div(tables * 4, SECTOR_SIZE);
        let gt_sectors = ceil_div(gtes * 4, SECTOR_SIZE);

        let mut header = base_header(self.capacity, self.grain_size, self.gtes);
        header.version = self.version;

        let mut next_sector = 1u64;
        let descriptor_bytes = self.descriptor.as_ref().map(|text| {
            let mut bytes = text.as_bytes().to_vec();
            pad_to_sector(&mut bytes);
            bytes
        });
        if let Some(bytes) = &descriptor_bytes {
            header.descriptor_offset = next_sector;
            header.descriptor_size = bytes.len() as u64 / SECTOR_SIZE;
            next_sector += header.descriptor_size;
        }

        let metadata_sectors = gd_sectors + tables * gt_sectors;
        let rgd_offset = if self.redundant {
            let at = next_sector;
            next_sector += metadata_sectors;
            at
        } else {
            0
        };
        let gd_offset = next_sector;
        next_sector += metadata_sectors;

        let overhead = ceil_div(next_sector, self.grain_size) * self.grain_size;

        // Grain table entries: allocate grains in index order after the overhead.
        let mut tables_entries = vec![vec![0u32; gtes as usize]; tables as usize];
        let mut grain_data = Vec::new();
        let mut sector = overhead;
        for (&index, data) in &self.grains {
            let (t, e) = ((index / gtes) as usize, (index % gtes) as usize);
            tables_entries[t][e] = sector as u32;
            let mut grain = data.clone();
            grain.resize(grain_bytes as usize, 0);
            grain_data.extend(grain);
            sector += self.grain_size;
        }
        for &index in &self.zeroed {
            let (t, e) = ((index / gtes) as usize, (index % gtes) as usize);
            tables_entries[t][e] = 1;
            header.flags |= FLAG_ZEROED_GTE;
        }

        let metadata_at = |start: u64| {
            let gd: Vec<u32> = (0..tables)
                .map(|t| (start + gd_sectors + t * gt_sectors) as u32)
                .collect();
            let mut bytes = entries_to_bytes(&gd, gd_sectors);
            for table in &tables_entries {
                bytes.extend(entries_to_bytes(table, gt_sectors));
            }
            bytes
        };

        header.gd_offset = if self.break_primary_gd {
            sector + 1000
        } else {
            gd_offset
        };
        if self.redundant {
            header.rgd_offset = rgd_offset;
            header.flags |= FLAG_REDUNDANT_GRAIN_TABLE;
        }
        header.overhead = overhead;

        let mut image = header.to_bytes();
        if let Some(bytes) = descriptor_bytes {
            image.extend(bytes);
        }
        if self.redundant {
            image.extend(metadata_at(rgd_offset));
        }
        image.extend(metadata_at(gd_offset));
        image.resize((overhead * SECTOR_SIZE) as usize, 0);
        image.extend(grain_data);
        image
    }
}

/// Builds streamOptimized extents the way a streaming writer lays them out:
/// header, compressed grain markers, grain tables, grain directory, footer,
/// end-of-stream.
pub struct StreamOptimizedBuilder {
    capacity: u64,
    grain_size: u64,
    gtes: u32,
    grains: BTreeMap<u64, Vec<u8>>,
    with_metadata: bool,
}

impl StreamOptimizedBuilder {
    pub fn new(capacity: u64, grain_size: u64, gtes: u32) -> Self {
        Self {
            capacity,
            grain_size,
            gtes,
            grains: BTreeMap::new(),
            with_metadata: true,
        }
    }

    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        self.grains.insert(index, data);
        self
    }

    /// Omits grain tables, grain directory and footer; only grains and
    /// end-of-stream are written and the header has no directory offset.
    pub fn markers_only(mut self) -> Self {
        self.with_metadata = false;
        self
    }

    fn metadata_marker(value: u64, marker_type: MarkerType) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR];
        buf[0..8].copy_from_slice(&value.to_le_bytes());
        buf[12..16].copy_from_slice(&(marker_type as u32).to_le_bytes());
        buf
    }

    pub fn build(self) -> Vec<u8> {
        let gtes = u64::from(self.gtes);
        let grains = ceil_div(self.capacity, self.grain_size);
        let tables = ceil_div(grains, gtes);
        let gd_sectors = ceil_div(tables * 4, SECTOR_SIZE);
        let gt_sectors = ceil_div(gtes * 4, SECTOR_SIZE);

        let mut header = base_header(self.capacity, self.grain_size, self.gtes);
        header.version = 3;
        header.flags |= FLAG_COMPRESSED | FLAG_MARKERS;
        header.compress_algorithm = COMPRESS_DEFLATE;
        header.overhead = 1;
        header.gd_offset = if self.with_metadata { GD_AT_END } else { 0 };

        let mut image = header.to_bytes();

        let mut offsets = BTreeMap::new();
        for (&index, data) in &self.grains {
            offsets.insert(index, image.len() as u64 / SECTOR_SIZE);
            let compressed = zlib(data);
            image.extend((index * self.grain_size).to_le_bytes());
            image.extend((compressed.len() as u32).to_le_bytes());
            image.extend(compressed);
            pad_to_sector(&mut image);
        }

        if self.with_metadata {
            let mut gd = vec![0u32; tables as usize];
            for t in 0..tables {
                let entries: Vec<u32> = (0..gtes)
                    .map(|e| offsets.get(&(t * gtes + e)).copied().unwrap_or(0) as u32)
                    .collect();
                if entries.iter().all(|&e| e == 0) {
                    continue;
                }
                image.extend(Self::metadata_marker(gt_sectors, MarkerType::GrainTable));
                gd[t as usize] = (image.len() as u64 / SECTOR_SIZE) as u32;
                image.extend(entries_to_bytes(&entries, gt_sectors));
            }

            image.extend(Self::metadata_marker(gd_sectors, MarkerType::GrainDirectory));
            let gd_offset = image.len() as u64 / SECTOR_SIZE;
            image.extend(entries_to_bytes(&gd, gd_sectors));

            let mut footer = header.clone();
            footer.gd_offset = gd_offset;
            image.extend(Self::metadata_marker(1, MarkerType::Footer));
            image.extend(footer.to_bytes());
        }

        image.extend(Self::metadata_marker(0, MarkerType::EndOfStream));
        image
    }
}

pub fn write_temp(data: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(data).expect("Failed to write test data");
    file.flush().expect("Failed to flush");
    file
}
