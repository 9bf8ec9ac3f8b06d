//! embedfs Core Library
//!
//! This crate exposes the content of opaque containers (VMware sparse disk
//! images and TAR archives) as read-only directory trees, without mounting
//! anything at the OS level.
//!
//! # Overview
//!
//! A VMDK sparse extent is decoded into a linear virtual disk
//! ([`SparseExtent`]), the filesystem on it is identified by signature
//! ([`detect_filesystem`]) and opened by a caller-supplied driver
//! ([`DriverRegistry`]). Archives are unpacked into a temp directory with
//! path-traversal checks ([`tar_to_temp_dir`]). Either way the result is an
//! [`EmbeddedDirFs`]: a reference-counted handle that deletes its temporary
//! state exactly once, when the last holder closes it.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Extraction limits and temp-file settings
//! - [`vmdk`] - Sparse extent header, geometry, grain directory, markers, reader
//! - [`detect`] - Filesystem signature detection
//! - [`partition`] - MBR/GPT partition tables and volume probing
//! - [`driver`] - Driver trait, registry and listing filters
//! - [`fs`] - Filesystem views and the `EmbeddedDirFs` handle
//! - [`archive`] - Safe TAR extraction
//! - [`image`] - VMDK to raw conversion and mounting
//!
//! # Quick Start
//!
//! ```no_run
//! use embedfs_core::tar_to_embedded_fs;
//! use embedfs_core::ExtractOptions;
//! use std::fs::File;
//!
//! let archive = File::open("/path/to/layer.tar").unwrap();
//! let fs = tar_to_embedded_fs(archive, &ExtractOptions::default()).unwrap();
//! let shared = fs.share().unwrap();
//!
//! println!("{:?}", shared.read_dir("/").unwrap());
//! shared.close().unwrap();
//! fs.close().unwrap(); // last close removes the extracted tree
//! ```

pub mod archive;
pub mod config;
pub mod detect;
pub mod driver;
pub mod error;
pub mod fs;
pub mod image;
pub mod partition;
pub mod vmdk;

mod read;

pub use error::{Error, Result};

pub use archive::{tar_to_embedded_fs, tar_to_temp_dir, tar_to_temp_dir_with};
pub use config::{ExtractOptions, DEFAULT_CHUNK_SIZE};
pub use detect::{classify, describe_filesystem, detect_filesystem, FilesystemKind, SIGNATURE_WINDOW};
pub use driver::{filter_system_entries, DriverRegistry, FilesystemDriver, MountedView};
pub use fs::{normalize_path, BackingResource, DirEntry, DirFs, EmbeddedDirFs, FileInfo, FsView};
pub use image::{
    convert_to_raw, extract_vmdk_to_temp, inspect_vmdk, mount_vmdk, ConvertProgress,
    ConvertSummary, DiskInfo, ExtractedImage, ProgressCallback,
};
pub use partition::{
    probe_volumes, read_partition_table, Partition, PartitionScheme, PartitionTable, Volume,
};
pub use vmdk::SparseExtent;
