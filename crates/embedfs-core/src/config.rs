//! Extraction limits and temp-file settings.

/// Default chunk size for VMDK to raw conversion (4 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default prefix for temporary directories and files.
pub const DEFAULT_TEMP_PREFIX: &str = "embedfs-";

/// Default cap on a single archive entry (16 GB).
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Default cap on all archive entries together (64 GB).
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Default cap on the number of archive entries.
pub const DEFAULT_MAX_ENTRIES: u64 = 1_000_000;

/// Options for extraction into temporary storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Largest regular file an archive may contain.
    pub max_entry_bytes: u64,
    /// Largest total size of regular files in one archive.
    pub max_total_bytes: u64,
    /// Most entries (of any type) one archive may contain.
    pub max_entries: u64,
    /// Prefix for temporary directory and file names.
    pub temp_prefix: String,
    /// Size of chunks copied per step when converting a disk image.
    pub chunk_size: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ExtractOptions {
    /// Create options with explicit limits and the default temp settings.
    pub fn new(max_entry_bytes: u64, max_total_bytes: u64, max_entries: u64) -> Self {
        Self {
            max_entry_bytes,
            max_total_bytes,
            max_entries,
            ..Self::default()
        }
    }

    /// Tight limits for untrusted input.
    pub fn strict() -> Self {
        Self {
            max_entry_bytes: 1024 * 1024 * 1024,
            max_total_bytes: 4 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            ..Self::default()
        }
    }

    /// No limits.
    pub fn unbounded() -> Self {
        Self {
            max_entry_bytes: u64::MAX,
            max_total_bytes: u64::MAX,
            max_entries: u64::MAX,
            ..Self::default()
        }
    }

    /// Replace the temp prefix.
    pub fn with_temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    /// Chunk size, never zero.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
