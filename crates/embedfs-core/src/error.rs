//! Error types for the embedfs core library.

use std::path::PathBuf;

/// The main error type for embedfs operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A format sentinel did not match; the data is not the expected format.
    #[error("invalid magic: expected 0x{expected:08X}, found 0x{found:08X}")]
    InvalidMagic { expected: u32, found: u32 },

    /// The source ended before a fixed-size record could be filled.
    #[error("short read of {what}: expected {expected} bytes, got {actual}")]
    ShortRead {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// The source is below the minimum size the format requires.
    #[error("file too small: {size} bytes, need at least {minimum}")]
    TooSmall { size: u64, minimum: u64 },

    /// Grain size or grain table entry count violates the format invariants.
    #[error("invalid grain geometry: {message}")]
    InvalidGeometry { message: String },

    /// The extent has no grain directory and cannot be addressed.
    #[error("extent has no grain directory")]
    NoGrainDirectory,

    /// A stream marker carried an unknown type tag.
    #[error("invalid stream marker type {marker_type} at offset {offset}")]
    InvalidMarker { marker_type: u32, offset: u64 },

    /// Any other VMDK decoding failure.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },

    /// An archive entry resolves outside the extraction root.
    #[error("archive entry '{entry}' escapes the extraction directory")]
    PathTraversal { entry: String },

    /// An archive violated an extraction limit or could not be decoded.
    #[error("archive error: {message}")]
    Archive { message: String },

    /// An MBR or GPT partition table is damaged.
    #[error("invalid partition table: {message}")]
    InvalidPartitionTable { message: String },

    /// No driver is registered for the detected filesystem.
    #[error("unsupported filesystem: {kind}")]
    UnsupportedFilesystem { kind: String },

    /// The filesystem handle was already closed.
    #[error("filesystem handle is closed")]
    Closed,

    /// One or more cleanup steps failed while releasing temporary state.
    #[error("cleanup failed: {}", failures.join("; "))]
    Cleanup { failures: Vec<String> },
}

/// A specialized Result type for embedfs operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a short read error.
    pub fn short_read(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShortRead {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Create an invalid geometry error.
    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            message: message.into(),
        }
    }

    /// Create a VMDK error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }

    /// Create a path traversal error.
    pub fn path_traversal(entry: impl Into<String>) -> Self {
        Self::PathTraversal {
            entry: entry.into(),
        }
    }

    /// Create an archive error.
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Create an invalid partition table error.
    pub fn invalid_partition_table(message: impl Into<String>) -> Self {
        Self::InvalidPartitionTable {
            message: message.into(),
        }
    }

    /// Returns true if the error means the data is not in the expected format
    /// at all, as opposed to being a damaged instance of it.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, Self::InvalidMagic { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, .. } => source,
            truncated @ (Error::ShortRead { .. } | Error::TooSmall { .. }) => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, truncated)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk.vmdk"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_invalid_magic_message() {
        let err = Error::InvalidMagic {
            expected: 0x564D444B,
            found: 0xDEADBEEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x564D444B"));
        assert!(msg.contains("0xDEADBEEF"));
        assert!(err.is_format_mismatch());
    }

    #[test]
    fn test_short_read_message() {
        let err = Error::short_read("sparse extent header", 512, 10);
        assert_eq!(
            err.to_string(),
            "short read of sparse extent header: expected 512 bytes, got 10"
        );
        assert!(!err.is_format_mismatch());
    }

    #[test]
    fn test_cleanup_joins_failures() {
        let err = Error::Cleanup {
            failures: vec!["remove /tmp/a: denied".into(), "remove /tmp/b: busy".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/a"));
        assert!(msg.contains("/tmp/b"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }

    #[test]
    fn test_into_io_error_kinds() {
        let eof: std::io::Error = Error::short_read("grain", 4, 0).into();
        assert_eq!(eof.kind(), std::io::ErrorKind::UnexpectedEof);

        let invalid: std::io::Error = Error::NoGrainDirectory.into();
        assert_eq!(invalid.kind(), std::io::ErrorKind::InvalidData);
    }
}
