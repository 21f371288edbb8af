// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Detect the type of an Android image from its magic values.

use std::{
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    config::SparseConfig,
    format::{ext4, sparse},
    stream::{FileLen, ReadAt},
};

const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";
const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
const SPARSE_MAGIC: u32 = 0xed26ff3a;
const EROFS_MAGIC: u32 = 0xe0f5e1e2;
const EROFS_MAGIC_OFFSET: u64 = 1024;
/// Offset of the superblock magic within an ext2/3/4 image.
const EXT4_MAGIC_OFFSET: u64 = ext4::SUPERBLOCK_OFFSET + 56;
/// Dynamic partition geometry, after the reserved region.
const LP_GEOMETRY_MAGIC: u32 = 0x616c4467;
const LP_GEOMETRY_OFFSET: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to check for sparse image")]
    Sparse(#[from] sparse::Error),
    #[error("Failed to read image: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    /// Sparse image whose header starts at `offset`.
    Sparse { offset: u64 },
    Ext4,
    Erofs,
    /// Dynamic partition container.
    Super,
    Boot,
    VendorBoot,
    Payload,
    Unknown,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sparse { .. } => "sparse",
            Self::Ext4 => "ext4",
            Self::Erofs => "erofs",
            Self::Super => "super",
            Self::Boot => "boot",
            Self::VendorBoot => "vendor_boot",
            Self::Payload => "payload",
            Self::Unknown => "unknown",
        })
    }
}

/// Read `N` bytes at `offset`, or [`None`] if the file is too short.
fn read_magic<const N: usize, R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
    file_len: u64,
) -> Result<Option<[u8; N]>> {
    if file_len.saturating_sub(offset) < N as u64 {
        return Ok(None);
    }

    let mut buf = [0u8; N];
    reader
        .read_exact_at(&mut buf, offset)
        .map_err(|e| Error::DataRead("magic", e))?;

    Ok(Some(buf))
}

/// Detect the image type. Fixed-offset magic values are checked first. Only
/// if none match is the beginning of the file scanned for a sparse header
/// behind a vendor-specific prefix.
pub fn probe_reader<R: ReadAt + ?Sized>(reader: &R, scan_limit: u64) -> Result<ImageType> {
    let file_len = reader
        .file_len()
        .map_err(|e| Error::DataRead("file_len", e))?;

    if let Some(magic) = read_magic::<8, _>(reader, 0, file_len)? {
        if &magic == BOOT_MAGIC {
            return Ok(ImageType::Boot);
        } else if &magic == VENDOR_BOOT_MAGIC {
            return Ok(ImageType::VendorBoot);
        } else if magic.starts_with(PAYLOAD_MAGIC) {
            return Ok(ImageType::Payload);
        }
    }

    let le_u32 = |offset| -> Result<Option<u32>> {
        Ok(read_magic::<4, _>(reader, offset, file_len)?.map(u32::from_le_bytes))
    };

    let header_size = sparse::HEADER_SIZE as u64;

    if file_len >= header_size
        && le_u32(0)? == Some(SPARSE_MAGIC)
        && let sparse::ImageKind::Sparse { offset, .. } =
            sparse::classify_reader(reader, header_size)?
    {
        return Ok(ImageType::Sparse { offset });
    }

    let ext4_magic =
        read_magic::<2, _>(reader, EXT4_MAGIC_OFFSET, file_len)?.map(u16::from_le_bytes);
    if ext4_magic == Some(ext4::SUPERBLOCK_MAGIC) {
        return Ok(ImageType::Ext4);
    } else if le_u32(EROFS_MAGIC_OFFSET)? == Some(EROFS_MAGIC) {
        return Ok(ImageType::Erofs);
    } else if le_u32(LP_GEOMETRY_OFFSET)? == Some(LP_GEOMETRY_MAGIC) {
        return Ok(ImageType::Super);
    }

    if file_len >= header_size
        && let sparse::ImageKind::Sparse { offset, .. } =
            sparse::classify_reader(reader, scan_limit)?
    {
        debug!("Found sparse header behind {offset} byte prefix");
        return Ok(ImageType::Sparse { offset });
    }

    Ok(ImageType::Unknown)
}

pub fn probe(path: &Path, config: &SparseConfig) -> Result<ImageType> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;

    probe_reader(&file, config.scan_limit)
}
