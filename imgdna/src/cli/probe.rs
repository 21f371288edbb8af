// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    config::Config,
    format::probe::{self, ImageType},
};

pub fn probe_main(cli: &ProbeCli, config: &Config) -> Result<()> {
    for path in &cli.input {
        let image_type = probe::probe(path, &config.sparse)
            .with_context(|| format!("Failed to probe image: {path:?}"))?;

        match image_type {
            ImageType::Sparse { offset } if offset != 0 => {
                println!("{}: {image_type} (offset {offset})", path.display());
            }
            _ => println!("{}: {image_type}", path.display()),
        }
    }

    Ok(())
}

/// Detect the type of Android images.
#[derive(Debug, Parser)]
pub struct ProbeCli {
    /// Paths to input images.
    #[arg(short, long, value_name = "FILE", value_parser, num_args = 1.., required = true)]
    input: Vec<PathBuf>,
}
