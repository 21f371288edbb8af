// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::{
    cli::{self, status, warning},
    config::Config,
    format::payload::Payload,
};

fn open_payload(path: &Path) -> Result<(BufReader<File>, Payload)> {
    let mut reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open payload for reading: {path:?}"))?;
    let payload = Payload::open(&mut reader)
        .with_context(|| format!("Failed to read payload metadata: {path:?}"))?;

    Ok((reader, payload))
}

fn info_subcommand(payload_cli: &PayloadCli, cli: &InfoCli) -> Result<()> {
    let (_, payload) = open_payload(&cli.input)?;

    cli::print_report(&payload.report);

    if !payload_cli.quiet {
        println!("{:#?}", payload.header);
        println!("Block size: {}", payload.manifest.block_size());
        println!(
            "Metadata signatures: {}",
            payload
                .metadata_signatures
                .as_ref()
                .map_or(0, |s| s.signatures.len()),
        );
    }

    for partition in &payload.manifest.partitions {
        let size = partition
            .new_partition_info
            .as_ref()
            .and_then(|i| i.size)
            .unwrap_or_default();

        println!(
            "{}.img: {size} bytes, {} operations",
            partition.partition_name,
            partition.operations.len(),
        );
    }

    Ok(())
}

fn extract_subcommand(cli: &ExtractCli, config: &Config) -> Result<()> {
    let (mut reader, payload) = open_payload(&cli.input)?;

    cli::print_report(&payload.report);

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let outcomes = payload.reconstruct(
        &mut reader,
        cli.partition.as_deref(),
        &cli.output,
        &config.payload,
    );

    if outcomes.is_empty() {
        if let Some(name) = &cli.partition {
            warning!("No partition matches {name:?}");
        }
        return Ok(());
    }

    let mut failed = 0;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => {
                cli::print_report(report);
                status!("Extracted {}: {:?}", outcome.name, outcome.path);
            }
            Err(e) => {
                failed += 1;
                warning!("Failed to extract {}: {e}", outcome.name);
            }
        }
    }

    if failed != 0 {
        bail!("Failed to extract {failed} of {} partitions", outcomes.len());
    }

    Ok(())
}

pub fn payload_main(cli: &PayloadCli, config: &Config) -> Result<()> {
    match &cli.command {
        PayloadCommand::Info(c) => info_subcommand(cli, c),
        PayloadCommand::Extract(c) => extract_subcommand(c, config),
    }
}

/// Display payload information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Extract partition images from a full OTA payload.
///
/// Each partition is written to `<partition name>.img` in the output
/// directory. A partition that fails to extract is removed without affecting
/// the other partitions.
#[derive(Debug, Parser)]
struct ExtractCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output images directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output: PathBuf,

    /// Only extract the specified partition.
    ///
    /// Both `<name>` and `<name>.img` are accepted.
    #[arg(short, long, value_name = "NAME")]
    partition: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PayloadCommand {
    Info(InfoCli),
    Extract(ExtractCli),
}

/// Inspect and extract OTA payloads.
#[derive(Debug, Parser)]
pub struct PayloadCli {
    #[command(subcommand)]
    command: PayloadCommand,

    /// Don't print payload header information.
    #[arg(short, long, global = true)]
    quiet: bool,
}
