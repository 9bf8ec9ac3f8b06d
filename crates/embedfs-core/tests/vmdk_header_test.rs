//! Integration tests for header, footer, geometry and grain directory decoding.

mod common;

use std::io::Cursor;

use common::base_header;
use embedfs_core::vmdk::header::{
    read_footer_if_gd_at_end, read_header_at, SparseExtentHeader, GD_AT_END, VMDK_MAGIC,
};
use embedfs_core::vmdk::{read_grain_directory, GrainGeometry};
use embedfs_core::Error;

#[test]
fn test_short_buffer_never_yields_header() {
    let full = base_header(1024, 128, 512).to_bytes();
    for len in [0usize, 1, 4, 79, 256, 511] {
        let err = read_header_at(&mut Cursor::new(full[..len].to_vec()), 0)
            .expect_err("short header must fail");
        assert!(
            matches!(err, Error::ShortRead { expected: 512, .. }),
            "len {} gave {:?}",
            len,
            err
        );
    }
}

#[test]
fn test_header_round_trip_is_byte_exact() {
    let mut header = base_header(123_456, 128, 512);
    header.descriptor_offset = 1;
    header.descriptor_size = 20;
    header.gd_offset = 300;
    header.rgd_offset = 21;
    header.overhead = 384;
    header.compress_algorithm = 1;
    header.reserved[10] = 0x42;

    let bytes = header.to_bytes();
    let decoded = SparseExtentHeader::from_bytes(&bytes).expect("decode header");
    assert_eq!(decoded, header);
    assert_eq!(decoded.to_bytes(), bytes);
}

#[test]
fn test_magic_checked_before_fields() {
    let mut bytes = base_header(1024, 128, 512).to_bytes();
    bytes[0] = b'X';
    let err = read_header_at(&mut Cursor::new(bytes), 0).expect_err("bad magic");
    assert!(err.is_format_mismatch());
}

#[test]
fn test_footer_supersedes_header() {
    // 2048-byte file; the footer sits at size - 1536 + 512 = 1024.
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = GD_AT_END;

    let mut data = vec![0u8; 2048];
    data[..512].copy_from_slice(&header.to_bytes());
    data[1024..1028].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
    data[1028..1032].copy_from_slice(&2u32.to_le_bytes());

    let mut cursor = Cursor::new(data);
    let mut header = read_header_at(&mut cursor, 0).expect("read header");
    read_footer_if_gd_at_end(&mut cursor, &mut header).expect("read footer");

    assert_eq!(header.version, 2);
    assert_eq!(header.gd_offset, 0);
    assert_eq!(header.capacity, 0);
}

#[test]
fn test_footer_requires_three_sectors() {
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = GD_AT_END;
    let mut data = header.to_bytes();
    data.resize(1535, 0);

    let err = read_footer_if_gd_at_end(&mut Cursor::new(data), &mut header)
        .expect_err("file too small for footer");
    assert!(matches!(
        err,
        Error::TooSmall {
            size: 1535,
            minimum: 1536
        }
    ));
}

#[test]
fn test_footer_with_bad_magic_fails() {
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = GD_AT_END;
    let mut data = vec![0u8; 4096];
    data[..512].copy_from_slice(&header.to_bytes());

    let err = read_footer_if_gd_at_end(&mut Cursor::new(data), &mut header)
        .expect_err("zeroed footer");
    assert!(matches!(err, Error::InvalidMagic { .. }));
    assert_eq!(header.gd_offset, GD_AT_END, "header untouched on failure");
}

#[test]
fn test_footer_noop_without_sentinel() {
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = 7;
    let before = header.clone();
    read_footer_if_gd_at_end(&mut Cursor::new(Vec::new()), &mut header).expect("no-op");
    assert_eq!(header, before);
}

#[test]
fn test_reference_geometry() {
    let geometry = GrainGeometry::from_header(&base_header(1024, 128, 512)).expect("geometry");
    assert_eq!(
        (
            geometry.grains,
            geometry.grain_tables,
            geometry.gd_sectors,
            geometry.gt_sectors
        ),
        (8, 1, 1, 4)
    );
}

#[test]
fn test_read_grain_directory_first_entry() {
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = 1;
    let geometry = GrainGeometry::from_header(&header).expect("geometry");

    let mut data = vec![0u8; 1024];
    data[512..516].copy_from_slice(&0xCAFEBABEu32.to_le_bytes());

    let gd = read_grain_directory(&mut Cursor::new(data), &header, &geometry).expect("read gd");
    assert_eq!(gd.len(), 1);
    assert_eq!(gd[0], 0xCAFEBABE);
}

#[test]
fn test_truncated_grain_directory_is_fatal() {
    let mut header = base_header(1024, 128, 512);
    header.gd_offset = 1;
    let geometry = GrainGeometry::from_header(&header).expect("geometry");

    let data = vec![0u8; 600];
    let err = read_grain_directory(&mut Cursor::new(data), &header, &geometry)
        .expect_err("truncated gd");
    assert!(matches!(err, Error::ShortRead { .. }));
}
