//! Embedded VMDK descriptor parsing.
//!
//! Monolithic sparse extents carry their text descriptor inside the extent
//! file at `descriptor_offset`. Only the fields needed to describe the disk
//! and to spot child (delta) disks are kept.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Parent CID value meaning "no parent".
pub const NO_PARENT_CID: u32 = 0xffffffff;

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Raw disk data in a separate file.
    Flat,
    /// Hosted sparse extent with grain tables.
    Sparse,
    /// Zeroed data without storage.
    Zero,
    /// VMFS extent.
    Vmfs,
    /// VMFS sparse extent.
    VmfsSparse,
}

impl FromStr for ExtentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT" => Ok(Self::Flat),
            "SPARSE" => Ok(Self::Sparse),
            "ZERO" => Ok(Self::Zero),
            "VMFS" => Ok(Self::Vmfs),
            "VMFSSPARSE" => Ok(Self::VmfsSparse),
            _ => Err(Error::vmdk(format!("unknown extent type: {}", s))),
        }
    }
}

/// One extent line of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Access mode ("RW", "RDONLY", "NOACCESS").
    pub access: String,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    /// Type of the extent.
    pub extent_type: ExtentType,
    /// Filename of the extent file.
    pub filename: String,
    /// Offset within the extent file in sectors.
    pub offset: u64,
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkDescriptor {
    /// Content ID.
    pub cid: u32,
    /// Parent content ID, [`NO_PARENT_CID`] for base disks.
    pub parent_cid: u32,
    /// Disk type, e.g. "monolithicSparse" or "streamOptimized".
    pub create_type: String,
    /// Extent lines.
    pub extents: Vec<Extent>,
    /// Adapter type from the disk database, if present.
    pub adapter_type: Option<String>,
}

impl VmdkDescriptor {
    /// True if this disk is a delta that needs a parent to be read.
    pub fn has_parent(&self) -> bool {
        self.parent_cid != NO_PARENT_CID
    }

    /// Total disk size in sectors across all extents.
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }
}

/// Parses an embedded descriptor region.
///
/// The region is NUL padded to a sector multiple; everything from the first
/// NUL on is ignored.
pub fn parse_embedded_descriptor(region: &[u8]) -> Result<VmdkDescriptor> {
    let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
    let text = std::str::from_utf8(&region[..end])
        .map_err(|e| Error::vmdk(format!("descriptor is not valid UTF-8: {}", e)))?;
    parse_descriptor(text)
}

/// Parses descriptor text.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut descriptor = VmdkDescriptor {
        cid: 0,
        parent_cid: NO_PARENT_CID,
        create_type: String::new(),
        extents: Vec::new(),
        adapter_type: None,
    };

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if ["RW ", "RDONLY ", "NOACCESS "]
            .iter()
            .any(|prefix| line.starts_with(prefix))
        {
            descriptor.extents.push(parse_extent_line(line)?);
            continue;
        }

        let Some((key, value)) = split_key_value(line) else {
            continue;
        };
        match key {
            "CID" => descriptor.cid = parse_hex(key, value)?,
            "parentCID" => descriptor.parent_cid = parse_hex(key, value)?,
            "createType" => descriptor.create_type = value.to_string(),
            "ddb.adapterType" => descriptor.adapter_type = Some(value.to_string()),
            _ => {}
        }
    }

    if descriptor.create_type.is_empty() {
        return Err(Error::vmdk("descriptor has no createType"));
    }
    Ok(descriptor)
}

fn parse_hex(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16).map_err(|_| Error::vmdk(format!("invalid {}: {}", key, value)))
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim(), value))
}

/// Parses `ACCESS SIZE TYPE "FILENAME" [OFFSET]`.
fn parse_extent_line(line: &str) -> Result<Extent> {
    let invalid = || Error::vmdk(format!("invalid extent line: {}", line));

    let mut fields = line.splitn(4, char::is_whitespace);
    let access = fields.next().ok_or_else(invalid)?.to_string();
    let size_sectors = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let extent_type = fields.next().ok_or_else(invalid)?.parse()?;
    let rest = fields.next().ok_or_else(invalid)?.trim();

    let quoted = rest.strip_prefix('"').ok_or_else(invalid)?;
    let (filename, tail) = quoted.split_once('"').ok_or_else(invalid)?;
    let tail = tail.trim();
    let offset = if tail.is_empty() {
        0
    } else {
        tail.parse().map_err(|_| invalid())?
    };

    Ok(Extent {
        access,
        size_sectors,
        extent_type,
        filename: filename.to_string(),
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONOLITHIC: &str = r#"# Disk DescriptorFile
version=1
CID=fb183c20
parentCID=ffffffff
createType="monolithicSparse"

# Extent description
RW 4192256 SPARSE "disk.vmdk"

# The Disk Data Base
#DDB

ddb.adapterType = "lsilogic"
"#;

    #[test]
    fn test_parse_monolithic_sparse() {
        let descriptor = parse_descriptor(MONOLITHIC).unwrap();
        assert_eq!(descriptor.cid, 0xfb183c20);
        assert!(!descriptor.has_parent());
        assert_eq!(descriptor.create_type, "monolithicSparse");
        assert_eq!(descriptor.adapter_type.as_deref(), Some("lsilogic"));
        assert_eq!(descriptor.extents.len(), 1);
        assert_eq!(descriptor.extents[0].extent_type, ExtentType::Sparse);
        assert_eq!(descriptor.extents[0].offset, 0);
        assert_eq!(descriptor.disk_size_sectors(), 4192256);
    }

    #[test]
    fn test_child_disk_has_parent() {
        let text = MONOLITHIC.replace("parentCID=ffffffff", "parentCID=1234abcd");
        assert!(parse_descriptor(&text).unwrap().has_parent());
    }

    #[test]
    fn test_extent_with_spaces_and_offset() {
        let extent = parse_extent_line("RDONLY 12345 FLAT \"my disk-flat.vmdk\" 128").unwrap();
        assert_eq!(extent.access, "RDONLY");
        assert_eq!(extent.filename, "my disk-flat.vmdk");
        assert_eq!(extent.offset, 128);
    }

    #[test]
    fn test_embedded_region_nul_terminated() {
        let mut region = MONOLITHIC.as_bytes().to_vec();
        region.resize(1024, 0);
        region[1000] = b'x';
        let descriptor = parse_embedded_descriptor(&region).unwrap();
        assert_eq!(descriptor.create_type, "monolithicSparse");
    }

    #[test]
    fn test_missing_create_type() {
        assert!(parse_descriptor("version=1\nCID=1\n").is_err());
    }

    #[test]
    fn test_unknown_extent_type() {
        assert!("BOGUS".parse::<ExtentType>().is_err());
        assert_eq!("vmfssparse".parse::<ExtentType>().unwrap(), ExtentType::VmfsSparse);
    }
}
