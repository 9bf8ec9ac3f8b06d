//! Filesystem signature detection.
//!
//! Classifies the filesystem at an offset from the magic bytes and OEM
//! labels found in the first [`SIGNATURE_WINDOW`] bytes.

use std::fmt;
use std::io::{Read, Seek};

use crate::error::Result;
use crate::read::read_exact_at;

/// Bytes inspected at the start of a partition or image.
pub const SIGNATURE_WINDOW: usize = 4096;

const EXT_MAGIC_OFFSET: usize = 0x438;
const EXT_MAGIC: &[u8] = &[0x53, 0xEF];
const NTFS_OEM_OFFSET: usize = 3;
const NTFS_OEM: &[u8] = b"NTFS    ";
const FAT32_LABEL_OFFSET: usize = 0x52;
const FAT32_LABEL: &[u8] = b"FAT32   ";
const EXFAT_OEM_OFFSET: usize = 3;
const EXFAT_OEM: &[u8] = b"EXFAT   ";

/// Filesystem families recognised by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemKind {
    /// ext2, ext3 or ext4.
    Ext,
    Ntfs,
    Fat32,
    ExFat,
    /// Nothing recognisable in the window.
    Unknown,
}

impl FilesystemKind {
    /// All kinds that carry a signature, in detection order.
    pub const DETECTABLE: [FilesystemKind; 4] = [
        FilesystemKind::Ext,
        FilesystemKind::Ntfs,
        FilesystemKind::Fat32,
        FilesystemKind::ExFat,
    ];

    /// Short label used in logs and diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            FilesystemKind::Ext => "ext4",
            FilesystemKind::Ntfs => "NTFS",
            FilesystemKind::Fat32 => "FAT32",
            FilesystemKind::ExFat => "exFAT",
            FilesystemKind::Unknown => "unknown",
        }
    }

    fn signature(self) -> Option<(usize, &'static [u8])> {
        match self {
            FilesystemKind::Ext => Some((EXT_MAGIC_OFFSET, EXT_MAGIC)),
            FilesystemKind::Ntfs => Some((NTFS_OEM_OFFSET, NTFS_OEM)),
            FilesystemKind::Fat32 => Some((FAT32_LABEL_OFFSET, FAT32_LABEL)),
            FilesystemKind::ExFat => Some((EXFAT_OEM_OFFSET, EXFAT_OEM)),
            FilesystemKind::Unknown => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifies a signature window. The first matching signature wins.
pub fn classify(window: &[u8]) -> FilesystemKind {
    FilesystemKind::DETECTABLE
        .into_iter()
        .find(|kind| {
            kind.signature().is_some_and(|(offset, magic)| {
                window.get(offset..offset + magic.len()) == Some(magic)
            })
        })
        .unwrap_or(FilesystemKind::Unknown)
}

/// Reads the signature window at `offset` and classifies it.
///
/// A window that cannot be filled is a `ShortRead` error, kept distinct
/// from [`FilesystemKind::Unknown`].
pub fn detect_filesystem<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
) -> Result<FilesystemKind> {
    let mut window = vec![0u8; SIGNATURE_WINDOW];
    read_exact_at(reader, offset, &mut window, "filesystem signature window")?;
    Ok(classify(&window))
}

/// Like [`detect_filesystem`] but flattened to a label for logging.
///
/// Read failures become `"read error: <cause>"`.
pub fn describe_filesystem<R: Read + Seek + ?Sized>(reader: &mut R, offset: u64) -> String {
    match detect_filesystem(reader, offset) {
        Ok(kind) => kind.label().to_string(),
        Err(e) => format!("read error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Cursor;

    fn window_with(offset: usize, bytes: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; SIGNATURE_WINDOW];
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[test]
    fn test_classify_each_signature() {
        assert_eq!(classify(&window_with(0x438, &[0x53, 0xEF])), FilesystemKind::Ext);
        assert_eq!(classify(&window_with(3, b"NTFS    ")), FilesystemKind::Ntfs);
        assert_eq!(classify(&window_with(0x52, b"FAT32   ")), FilesystemKind::Fat32);
        assert_eq!(classify(&window_with(3, b"EXFAT   ")), FilesystemKind::ExFat);
        assert_eq!(classify(&[0u8; SIGNATURE_WINDOW]), FilesystemKind::Unknown);
    }

    #[test]
    fn test_reversed_ext_magic_is_unknown() {
        assert_eq!(
            classify(&window_with(0x438, &[0xEF, 0x53])),
            FilesystemKind::Unknown
        );
    }

    #[test]
    fn test_detect_at_offset() {
        let mut data = vec![0u8; 1024];
        data.extend(window_with(3, b"NTFS    "));
        let kind = detect_filesystem(&mut Cursor::new(data), 1024).unwrap();
        assert_eq!(kind, FilesystemKind::Ntfs);
    }

    #[test]
    fn test_short_window() {
        let mut cursor = Cursor::new(vec![0u8; SIGNATURE_WINDOW - 1]);
        let err = detect_filesystem(&mut cursor, 0).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));

        let label = describe_filesystem(&mut cursor, 0);
        assert!(label.starts_with("read error: "));
    }

    #[test]
    fn test_labels() {
        assert_eq!(FilesystemKind::Ext.to_string(), "ext4");
        assert_eq!(FilesystemKind::ExFat.label(), "exFAT");
        assert_eq!(describe_filesystem(&mut Cursor::new(vec![0u8; 4096]), 0), "unknown");
    }
}
