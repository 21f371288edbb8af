// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{self, status},
    config::Config,
    format::sparse::{self, Chunk, CrcMode, Header, ImageKind, SparseReader},
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

#[derive(Clone)]
struct Metadata {
    offset: u64,
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("offset", &self.offset)
            .field("header", &self.header)
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

/// Data chunks are skipped, so checksums cannot be validated here.
fn read_metadata(path: &Path, offset: u64) -> Result<Metadata> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("Failed to seek file: {path:?}"))?;

    let mut reader = SparseReader::new_seekable(BufReader::new(file), CrcMode::Ignore)
        .with_context(|| format!("Failed to read sparse header: {path:?}"))?;
    // Accept whatever unsparse accepts. Oddities are logged as they are found.
    reader.set_lenient(true);
    let mut chunks = vec![];

    while let Some(chunk) = reader
        .next_chunk()
        .with_context(|| format!("Failed to read chunk: {path:?}"))?
    {
        chunks.push(chunk);
    }

    Ok(Metadata {
        offset,
        header: reader.header(),
        chunks,
    })
}

fn info_subcommand(sparse_cli: &SparseCli, cli: &InfoCli, config: &Config) -> Result<()> {
    let kind = sparse::classify(&cli.input, &config.sparse)
        .with_context(|| format!("Failed to classify image: {:?}", cli.input))?;

    match kind {
        ImageKind::Raw => {
            let size = sparse::raw_size(&cli.input, &config.sparse)
                .with_context(|| format!("Failed to get image size: {:?}", cli.input))?;

            status!("Raw image: {size} bytes");
        }
        ImageKind::Sparse { offset, header } => {
            status!(
                "Sparse image at offset {offset}: {} bytes unsparsed",
                header.logical_size(),
            );

            if !sparse_cli.quiet {
                let metadata = read_metadata(&cli.input, offset)?;
                println!("{metadata:#?}");
            }
        }
    }

    Ok(())
}

fn unsparse_subcommand(cli: &UnsparseCli, config: &Config) -> Result<()> {
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| sparse::unsparse_path(&cli.input));

    let report = sparse::decode_to(&cli.input, &output, &config.sparse)
        .with_context(|| format!("Failed to unsparse: {:?} -> {output:?}", cli.input))?;

    cli::print_report(&report);
    status!("Wrote raw image: {output:?}");

    Ok(())
}

fn pack_subcommand(sparse_cli: &SparseCli, cli: &PackCli) -> Result<()> {
    let header = sparse::encode(&cli.input, &cli.output, cli.block_size)
        .with_context(|| format!("Failed to pack: {:?} -> {:?}", cli.input, cli.output))?;

    if !sparse_cli.quiet {
        println!("{header:#?}");
    }
    status!("Wrote sparse image: {:?}", cli.output);

    Ok(())
}

pub fn sparse_main(cli: &SparseCli, config: &Config) -> Result<()> {
    match &cli.command {
        SparseCommand::Info(c) => info_subcommand(cli, c, config),
        SparseCommand::Unsparse(c) => unsparse_subcommand(c, config),
        SparseCommand::Pack(c) => pack_subcommand(cli, c),
    }
}

/// Detect whether a file is a sparse image and show its header and chunks.
///
/// Vendor-specific headers before the sparse header are skipped.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Convert a sparse image to a raw image.
#[derive(Debug, Parser)]
struct UnsparseCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    ///
    /// Defaults to `<input>.unsparse.img`, replacing any `.img` extension.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: Option<PathBuf>,
}

/// Convert a raw image to a sparse image.
///
/// Zero blocks are stored as holes and blocks consisting of a repeated 32-bit
/// value are stored as fill chunks.
#[derive(Debug, Parser)]
struct PackCli {
    /// Path to input raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Block size.
    ///
    /// The input size must be a multiple of this value.
    #[arg(short, long, value_name = "BYTES", default_value_t = sparse::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
}

#[derive(Debug, Subcommand)]
enum SparseCommand {
    Info(InfoCli),
    Unsparse(UnsparseCli),
    Pack(PackCli),
}

/// Inspect, unpack, and pack Android sparse images.
#[derive(Debug, Parser)]
pub struct SparseCli {
    #[command(subcommand)]
    command: SparseCommand,

    /// Don't print sparse image metadata.
    #[arg(short, long, global = true)]
    quiet: bool,
}
