// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Recoverable problems encountered while decoding or extracting. Fatal
//! problems are returned as errors from each module instead.

use std::{fmt, path::PathBuf};

use tracing::warn;

/// Which check failed for a decompressed payload operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mismatch {
    /// The decompressed size differs from the destination extent size.
    Length { expected: u64, actual: u64 },
    /// The SHA-256 digest of the compressed blob differs from the manifest.
    Digest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    DecompressionMismatch {
        partition: String,
        operation: usize,
        mismatch: Mismatch,
    },
    ExtraExtentsIgnored {
        partition: String,
        operation: usize,
        count: usize,
    },
    UnusualBlockSize {
        block_size: u32,
    },
    InvalidMetadataSignature {
        reason: String,
    },
    UnknownSparseChunk {
        chunk_type: u16,
        index: u32,
    },
    ShortSparseImage {
        missing_blocks: u32,
    },
    UnexpectedSparseChunkSize {
        index: u32,
        expected: u32,
        actual: u32,
    },
    NonEmptyCrc32Chunk {
        index: u32,
        blocks: u32,
    },
    ExtractionEntryFailure {
        path: String,
        reason: String,
    },
    UnmaterializedEntry {
        path: PathBuf,
    },
    InvalidCapability {
        path: String,
        size: usize,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecompressionMismatch {
                partition,
                operation,
                mismatch: Mismatch::Length { expected, actual },
            } => write!(
                f,
                "{partition}: operation #{operation}: expected {expected} decompressed bytes, \
                 but got {actual}",
            ),
            Self::DecompressionMismatch {
                partition,
                operation,
                mismatch: Mismatch::Digest,
            } => write!(
                f,
                "{partition}: operation #{operation}: compressed data digest does not match",
            ),
            Self::ExtraExtentsIgnored {
                partition,
                operation,
                count,
            } => write!(
                f,
                "{partition}: operation #{operation}: ignored {count} extra destination extents",
            ),
            Self::UnusualBlockSize { block_size } => {
                write!(f, "Manifest block size {block_size} is not 4096; using 4096")
            }
            Self::InvalidMetadataSignature { reason } => {
                write!(f, "Metadata signature block could not be decoded: {reason}")
            }
            Self::UnknownSparseChunk { chunk_type, index } => write!(
                f,
                "Chunk #{index}: unknown chunk type {chunk_type:#06x}; filled with zeros",
            ),
            Self::ShortSparseImage { missing_blocks } => write!(
                f,
                "Chunks end {missing_blocks} blocks before the declared size; padded with zeros",
            ),
            Self::UnexpectedSparseChunkSize {
                index,
                expected,
                actual,
            } => write!(
                f,
                "Chunk #{index}: expected total size {expected}, but have {actual}; \
                 using only the bytes the chunk type defines",
            ),
            Self::NonEmptyCrc32Chunk { index, blocks } => write!(
                f,
                "Chunk #{index}: CRC32 chunk claims {blocks} blocks; treated as empty",
            ),
            Self::ExtractionEntryFailure { path, reason } => {
                write!(f, "Failed to extract {path:?}: {reason}")
            }
            Self::UnmaterializedEntry { path } => {
                write!(f, "Special file not created on host: {path:?}")
            }
            Self::InvalidCapability { path, size } => {
                write!(f, "{path:?}: ignoring {size}-byte capability record")
            }
        }
    }
}

/// Ordered list of warnings accumulated during one operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    warnings: Vec<Warning>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning. It is also logged immediately so that long-running
    /// operations surface problems as they happen.
    pub fn push(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Append warnings that were already logged when they were recorded.
    pub fn extend(&mut self, other: Report) {
        self.warnings.extend(other.warnings);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}
