// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::{
    cli::{self, status},
    config::Config,
    extract,
    format::{
        ext4::Ext4Volume,
        sparse::{self, ImageKind},
    },
};

/// Get a raw image to read. Sparse images are converted next to the input
/// first.
fn raw_image(path: &Path, config: &Config) -> Result<PathBuf> {
    let kind = sparse::classify(path, &config.sparse)
        .with_context(|| format!("Failed to classify image: {path:?}"))?;

    match kind {
        ImageKind::Raw => Ok(path.to_owned()),
        ImageKind::Sparse { .. } => {
            let (output, report) = sparse::decode(path, &config.sparse)
                .with_context(|| format!("Failed to unsparse image: {path:?}"))?;

            cli::print_report(&report);
            status!("Converted sparse image: {output:?}");

            Ok(output)
        }
    }
}

/// `<output>/../config`, next to the extracted tree.
fn default_config_dir(output: &Path) -> PathBuf {
    output.parent().unwrap_or(Path::new("")).join("config")
}

fn extract_subcommand(cli: &ExtractCli, config: &Config) -> Result<()> {
    let name = match &cli.name {
        Some(n) => n.clone(),
        None => extract::partition_name(&cli.input)
            .ok_or_else(|| anyhow!("Cannot determine partition name: {:?}", cli.input))?,
    };
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| default_config_dir(&cli.output));

    let image = raw_image(&cli.input, config)?;
    let file =
        File::open(&image).with_context(|| format!("Failed to open for reading: {image:?}"))?;
    let volume = Ext4Volume::new(file)
        .with_context(|| format!("Failed to open ext4 filesystem: {image:?}"))?;

    info!("Superblock: {:?}", volume.superblock());

    let extraction = extract::extract(&volume, &name, &cli.output, &config_dir, &config.extract)
        .with_context(|| format!("Failed to extract {name}: {image:?} -> {:?}", cli.output))?;

    cli::print_report(&extraction.report);

    status!(
        "Extracted {} entries from {name} to {:?}",
        extraction.entries.len(),
        cli.output,
    );
    status!("Wrote fs_config: {:?}", extraction.artifacts.fs_config);
    status!("Wrote file_contexts: {:?}", extraction.artifacts.contexts);
    status!("Wrote space list: {:?}", extraction.artifacts.spaces);
    if let Some(path) = &extraction.artifacts.info {
        status!("Wrote filesystem info: {path:?}");
    }

    Ok(())
}

pub fn ext4_main(cli: &Ext4Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Ext4Command::Extract(c) => extract_subcommand(c, config),
    }
}

/// Extract an ext4 filesystem image and its metadata.
///
/// Files, directories, and symlinks are copied to the output directory. The
/// ownership, modes, capabilities, and SELinux contexts are written to
/// `<name>_fsconfig.txt` and `<name>_contexts.txt` in the config directory.
/// Sparse images are converted to raw images first.
#[derive(Debug, Parser)]
struct ExtractCli {
    /// Path to input ext4 image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output directory for the extracted files.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output: PathBuf,

    /// Path to output directory for the metadata files.
    ///
    /// Defaults to a `config` directory next to the output directory.
    #[arg(long, value_name = "DIR", value_parser)]
    config_dir: Option<PathBuf>,

    /// Partition name.
    ///
    /// Defaults to the input file name without the `.img` extension.
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Ext4Command {
    Extract(ExtractCli),
}

/// Extract ext4 filesystem images.
#[derive(Debug, Parser)]
pub struct Ext4Cli {
    #[command(subcommand)]
    command: Ext4Command,
}
