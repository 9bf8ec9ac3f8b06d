//! MBR and GPT partition table enumeration.
//!
//! Only the start and length of each partition matter here: they are the
//! offsets handed to the signature detector and the filesystem drivers.
//!
//! # MBR layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0x000   446   Bootstrap code
//! 0x1BE   16    Partition entry 1..4
//! 0x1FE   2     Boot signature (0xAA55)
//! ```
//!
//! A protective entry of type 0xEE means the real table is a GPT: header at
//! LBA 1, entry array wherever the header points. Extended MBR partitions
//! (logical volumes) are skipped.

use std::fmt;
use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::detect::{detect_filesystem, FilesystemKind};
use crate::error::{Error, Result};
use crate::read::read_exact_at;

/// Logical block size assumed for partition tables.
pub const LBA_SIZE: u64 = 512;

/// Boot signature closing an MBR sector.
pub const MBR_BOOT_SIGNATURE: u16 = 0xAA55;

/// Signature at the start of a GPT header.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;
const MBR_PARTITIONS: usize = 4;

const TYPE_EMPTY: u8 = 0x00;
const TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

const GPT_HEADER_MIN: usize = 92;
const GPT_ENTRY_MIN: u32 = 128;
const GPT_NAME_OFFSET: usize = 56;
const GPT_NAME_LEN: usize = 72;

/// Largest GPT entry array accepted, in bytes.
pub const MAX_GPT_ENTRIES_BYTES: u64 = 1024 * 1024;

/// Partitioning scheme of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Mbr => f.write_str("MBR"),
            PartitionScheme::Gpt => f.write_str("GPT"),
        }
    }
}

/// One partition table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Position of the entry in its table.
    pub index: usize,
    /// Byte offset of the first sector.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// MBR type byte ("type 0x07") or the GPT partition name, falling back
    /// to its type GUID.
    pub label: String,
}

/// Partitions found on a disk, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub partitions: Vec<Partition>,
}

/// Reads the partition table at the start of a disk.
///
/// Returns `Ok(None)` when sector 0 does not carry the MBR boot signature.
/// A protective MBR without a valid GPT behind it is an error.
pub fn read_partition_table<R: Read + Seek + ?Sized>(
    reader: &mut R,
) -> Result<Option<PartitionTable>> {
    let mut mbr = [0u8; LBA_SIZE as usize];
    read_exact_at(reader, 0, &mut mbr, "master boot record")?;

    let signature = u16::from_le_bytes([
        mbr[BOOT_SIGNATURE_OFFSET],
        mbr[BOOT_SIGNATURE_OFFSET + 1],
    ]);
    if signature != MBR_BOOT_SIGNATURE {
        return Ok(None);
    }

    let mut partitions = Vec::new();
    let mut protective = false;
    for index in 0..MBR_PARTITIONS {
        let start = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
        let entry = &mbr[start..start + PARTITION_ENTRY_SIZE];

        let kind = entry[4];
        let lba_start = le_u32(entry, 8);
        let lba_length = le_u32(entry, 12);
        if kind == TYPE_EMPTY || lba_length == 0 {
            continue;
        }
        if kind == TYPE_GPT_PROTECTIVE {
            protective = true;
            continue;
        }
        if EXTENDED_TYPES.contains(&kind) {
            debug!(index, kind, "not following extended partition");
            continue;
        }

        partitions.push(Partition {
            index,
            offset: u64::from(lba_start) * LBA_SIZE,
            length: u64::from(lba_length) * LBA_SIZE,
            label: format!("type 0x{:02X}", kind),
        });
    }

    if protective {
        return read_gpt(reader).map(Some);
    }

    Ok(Some(PartitionTable {
        scheme: PartitionScheme::Mbr,
        partitions,
    }))
}

fn read_gpt<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<PartitionTable> {
    let mut header = [0u8; LBA_SIZE as usize];
    read_exact_at(reader, LBA_SIZE, &mut header, "GPT header")?;

    if &header[0..8] != GPT_SIGNATURE {
        return Err(Error::invalid_partition_table(
            "protective MBR without a GPT header",
        ));
    }

    let header_size = le_u32(&header, 12) as usize;
    if !(GPT_HEADER_MIN..=header.len()).contains(&header_size) {
        return Err(Error::invalid_partition_table(format!(
            "GPT header size {} out of range",
            header_size
        )));
    }
    let mut checked = header[..header_size].to_vec();
    checked[16..20].fill(0);
    if crc32fast::hash(&checked) != le_u32(&header, 16) {
        return Err(Error::invalid_partition_table("GPT header checksum mismatch"));
    }

    let entries_lba = le_u64(&header, 72);
    let entry_count = le_u32(&header, 80);
    let entry_size = le_u32(&header, 84);
    if entry_size < GPT_ENTRY_MIN || entry_size % 8 != 0 {
        return Err(Error::invalid_partition_table(format!(
            "GPT entry size {} unsupported",
            entry_size
        )));
    }
    let total = u64::from(entry_count) * u64::from(entry_size);
    if total > MAX_GPT_ENTRIES_BYTES {
        return Err(Error::invalid_partition_table(format!(
            "GPT entry array of {} bytes exceeds limit of {}",
            total, MAX_GPT_ENTRIES_BYTES
        )));
    }
    let offset = entries_lba.checked_mul(LBA_SIZE).ok_or_else(|| {
        Error::invalid_partition_table(format!("GPT entry LBA {} overflows", entries_lba))
    })?;

    let mut entries = vec![0u8; total as usize];
    read_exact_at(reader, offset, &mut entries, "GPT partition entries")?;
    if crc32fast::hash(&entries) != le_u32(&header, 88) {
        return Err(Error::invalid_partition_table(
            "GPT partition entries checksum mismatch",
        ));
    }

    let partitions = entries
        .chunks_exact(entry_size as usize)
        .enumerate()
        .filter_map(|(index, entry)| gpt_partition(index, entry))
        .collect();

    Ok(PartitionTable {
        scheme: PartitionScheme::Gpt,
        partitions,
    })
}

fn gpt_partition(index: usize, entry: &[u8]) -> Option<Partition> {
    let type_guid = &entry[0..16];
    if type_guid.iter().all(|&b| b == 0) {
        return None;
    }

    let first = le_u64(entry, 32);
    let last = le_u64(entry, 40);
    if last < first {
        warn!(index, first, last, "skipping GPT entry with inverted range");
        return None;
    }
    let offset = first.checked_mul(LBA_SIZE)?;
    let length = (last - first).checked_add(1)?.checked_mul(LBA_SIZE)?;

    let units: Vec<u16> = entry[GPT_NAME_OFFSET..GPT_NAME_OFFSET + GPT_NAME_LEN]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    let name = String::from_utf16_lossy(&units);
    let label = if name.is_empty() {
        format_guid(type_guid)
    } else {
        name
    };

    Some(Partition {
        index,
        offset,
        length,
        label,
    })
}

/// Formats a GUID stored in the mixed-endian on-disk layout.
fn format_guid(b: &[u8]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
        b[14], b[15]
    )
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// A filesystem candidate inside a raw disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Partition holding the volume; None for an unpartitioned disk.
    pub partition: Option<Partition>,
    /// Byte offset handed to detection and drivers.
    pub offset: u64,
    pub kind: FilesystemKind,
}

/// Lists the volumes of a raw disk with their detected filesystems.
///
/// A filesystem at offset 0 wins over a partition table: FAT and NTFS boot
/// sectors end with the same 0xAA55 signature as an MBR. A disk with no
/// table, or an empty one, yields a single unknown volume at offset 0.
/// Partitions whose signature window cannot be read are reported unknown.
pub fn probe_volumes<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Vec<Volume>> {
    let whole = detect_filesystem(reader, 0)?;
    let unpartitioned = |kind| {
        vec![Volume {
            partition: None,
            offset: 0,
            kind,
        }]
    };
    if whole != FilesystemKind::Unknown {
        return Ok(unpartitioned(whole));
    }

    let table = match read_partition_table(reader)? {
        Some(table) if !table.partitions.is_empty() => table,
        _ => return Ok(unpartitioned(FilesystemKind::Unknown)),
    };
    debug!(
        scheme = %table.scheme,
        partitions = table.partitions.len(),
        "read partition table"
    );

    Ok(table
        .partitions
        .into_iter()
        .map(|partition| {
            let kind = match detect_filesystem(reader, partition.offset) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(index = partition.index, offset = partition.offset, error = %e, "partition unreadable");
                    FilesystemKind::Unknown
                }
            };
            Volume {
                offset: partition.offset,
                kind,
                partition: Some(partition),
            }
        })
        .collect())
}
