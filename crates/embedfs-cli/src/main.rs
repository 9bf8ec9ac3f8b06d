//! embedfs CLI - Inspect VMDK images and archives without mounting them.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embedfs_core::{
    convert_to_raw, describe_filesystem, inspect_vmdk, probe_volumes, tar_to_embedded_fs,
    tar_to_temp_dir_with, ConvertProgress, EmbeddedDirFs, ExtractOptions, SparseExtent,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Read VMware sparse disks and archives as plain directory trees.
#[derive(Parser)]
#[command(name = "embedfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, geometry and descriptor details of a sparse extent.
    Inspect {
        /// Path to the VMDK file.
        vmdk_file: PathBuf,
    },

    /// Identify the filesystems of a raw image, per partition.
    Detect {
        /// Path to the raw image or partition dump.
        image: PathBuf,

        /// Check only this byte offset instead of probing partitions.
        #[arg(short, long)]
        offset: Option<u64>,
    },

    /// Write the virtual disk of a sparse extent to a raw image.
    Convert {
        /// Path to the VMDK file.
        vmdk_file: PathBuf,

        /// Output raw image path.
        #[arg(short, long)]
        output: PathBuf,

        /// Chunk size in megabytes.
        #[arg(long, default_value = "4")]
        chunk_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Extract a TAR (optionally gzip-compressed) archive safely.
    Untar {
        /// Path to the archive.
        archive: PathBuf,

        /// Keep the extracted directory and print its path.
        #[arg(long)]
        keep: bool,

        /// Use tight size and entry limits.
        #[arg(long)]
        strict: bool,

        /// Maximum number of entries.
        #[arg(long)]
        max_entries: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { vmdk_file } => show_info(&vmdk_file)?,
        Commands::Detect { image, offset } => run_detect(&image, offset)?,
        Commands::Convert {
            vmdk_file,
            output,
            chunk_size,
            quiet,
        } => run_convert(&vmdk_file, &output, chunk_size, quiet)?,
        Commands::Untar {
            archive,
            keep,
            strict,
            max_entries,
        } => {
            let mut options = if strict {
                ExtractOptions::strict()
            } else {
                ExtractOptions::default()
            };
            if let Some(max_entries) = max_entries {
                options.max_entries = max_entries;
            }
            run_untar(&archive, keep, &options)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn show_info(vmdk_file: &Path) -> Result<()> {
    let info = inspect_vmdk(vmdk_file)
        .with_context(|| format!("could not inspect {}", vmdk_file.display()))?;

    println!("Sparse Extent");
    println!("=============");
    println!();
    println!("Version:     {}", info.version);
    println!("Capacity:    {}", format_bytes(info.capacity_bytes));
    println!("Grain size:  {}", format_bytes(info.grain_size_bytes));
    println!("Grains:      {}", info.grains);
    println!("Tables:      {}", info.grain_tables);
    println!("Compressed:  {}", yes_no(info.compressed));
    println!("Markers:     {}", yes_no(info.has_markers));
    if info.scanned {
        println!("Index:       stream marker scan");
    } else {
        println!("Index:       grain directory");
    }
    match &info.create_type {
        Some(create_type) => println!("Type:        {}", create_type),
        None => println!("Type:        (no embedded descriptor)"),
    }
    if info.has_parent {
        println!();
        println!("Note: this is a child disk; reads need its parent.");
    }

    Ok(())
}

fn run_detect(image: &Path, offset: Option<u64>) -> Result<()> {
    let mut file = File::open(image).with_context(|| format!("opening {}", image.display()))?;

    if let Some(offset) = offset {
        println!("{}", describe_filesystem(&mut file, offset));
        return Ok(());
    }

    let volumes = probe_volumes(&mut file)
        .with_context(|| format!("could not probe {}", image.display()))?;
    for volume in &volumes {
        match &volume.partition {
            Some(partition) => println!(
                "#{} {:>12} {:>10}  {} ({})",
                partition.index,
                volume.offset,
                format_bytes(partition.length),
                volume.kind,
                partition.label
            ),
            None => println!("{}", volume.kind),
        }
    }
    Ok(())
}

fn run_convert(vmdk_file: &Path, output: &Path, chunk_size_mb: usize, quiet: bool) -> Result<()> {
    let mut extent = SparseExtent::open(vmdk_file)
        .with_context(|| format!("could not open {}", vmdk_file.display()))?;
    let total = extent.capacity();

    if !quiet {
        println!("Source:    {}", vmdk_file.display());
        println!("Capacity:  {}", format_bytes(total));
        println!("Output:    {}", output.display());
        println!();
    }

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let callback: Option<embedfs_core::ProgressCallback> = progress_bar.clone().map(|pb| {
        Box::new(move |progress: ConvertProgress| pb.set_position(progress.bytes_processed))
            as embedfs_core::ProgressCallback
    });

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let summary = convert_to_raw(
        &mut extent,
        &mut writer,
        chunk_size_mb.max(1) * 1024 * 1024,
        callback.as_ref(),
    )?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }

    if !quiet {
        println!();
        println!("Wrote {} to {}", format_bytes(summary.bytes_written), output.display());
    }
    println!("SHA256({}) = {}", output.display(), summary.sha256);

    Ok(())
}

fn run_untar(archive: &Path, keep: bool, options: &ExtractOptions) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;

    if keep {
        let root = tar_to_temp_dir_with(file, options)
            .with_context(|| format!("could not extract {}", archive.display()))?;
        println!("{}", root.display());
        return Ok(());
    }

    let fs = tar_to_embedded_fs(file, options)
        .with_context(|| format!("could not extract {}", archive.display()))?;
    let listed = list_tree(&fs, "/", 0);
    fs.close()?;
    listed
}

fn list_tree(fs: &EmbeddedDirFs, dir: &str, depth: usize) -> Result<()> {
    for entry in fs.read_dir(dir)? {
        let path = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
        if entry.is_dir {
            println!("{}{}/", "  ".repeat(depth), entry.name);
            list_tree(fs, &path, depth + 1)?;
        } else {
            println!(
                "{}{} ({})",
                "  ".repeat(depth),
                entry.name,
                format_bytes(entry.size)
            );
        }
    }
    debug!(dir, "listed directory");
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.00 MB");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["embedfs", "-v", "detect", "disk.raw", "--offset", "1048576"]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Detect {
                offset: Some(1048576),
                ..
            }
        ));

        let cli = Cli::parse_from(["embedfs", "detect", "disk.raw"]);
        assert!(matches!(cli.command, Commands::Detect { offset: None, .. }));

        let cli = Cli::parse_from(["embedfs", "untar", "layer.tar", "--keep", "--max-entries", "5"]);
        assert!(matches!(
            cli.command,
            Commands::Untar {
                keep: true,
                max_entries: Some(5),
                ..
            }
        ));
    }
}
