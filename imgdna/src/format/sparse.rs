// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse image reading, writing, and conversion.
//!
//! A sparse image may be preceded by a vendor-specific header. The actual
//! sparse header is found by scanning the beginning of the file for the magic
//! value, and everything before it is ignored.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    mem,
    ops::Range,
    path::{Path, PathBuf},
};

use crc32fast::Hasher;
use dlv_list::{Index, VecList};
use memchr::memmem;
use thiserror::Error;
use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    config::SparseConfig,
    report::{Report, Warning},
    stream::{FileLen, ReadAt, ReadDiscardExt, WriteZerosExt},
    util,
};

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u16 = 0;

/// Size of the fixed portion of the file header.
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
/// Size of the fixed portion of a chunk header.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<RawChunk>();

/// Default block size used when packing images.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Size of the window used when scanning for the header magic.
const SCAN_WINDOW: usize = 1024 * 1024;

/// Data chunks are split so that none exceed this size. This matches AOSP's
/// libsparse and keeps chunk sizes well within [`u32`].
const MAX_DATA_CHUNK_BYTES: u32 = 64 * 1024 * 1024;

/// Ways in which the contents of a sparse image can be invalid.
#[derive(Debug, Error)]
pub enum Corruption {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} < {size}", size = HEADER_SIZE)]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {size}", size = CHUNK_HEADER_SIZE)]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Size overflow: {chunk_size} * {block_size}")]
    ChunkSizeOverflow {
        index: u32,
        chunk_size: u32,
        block_size: u32,
    },
    #[error("Chunk #{index}: Data size too large: {data_size}")]
    DataSizeTooLarge { index: u32, data_size: u32 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk is not empty")]
    Crc32ChunkNotEmpty { index: u32, chunk_size: u32 },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u32,
        total_size: u32,
    },
    #[error("Chunk #{index}: {needed} bytes of chunk data, but only {available} bytes remain")]
    ChunkPastEof {
        index: u32,
        needed: u64,
        available: u64,
    },
    #[error("Reached end of file while reading {0}")]
    Truncated(&'static str),
    // Checksum errors.
    #[error("Expected checkpoint CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Checkpoint { expected: u32, actual: u32 },
    #[error("Expected final CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Final { expected: u32, actual: u32 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Corrupt sparse image")]
    CorruptSparseImage(#[from] Corruption),
    #[error("File is too small to be an image: {size} bytes")]
    UnknownImage { size: u64 },
    // Reader errors.
    #[error("Must fully consume data when CRC validation is enabled")]
    Crc32RandomRead,
    #[error("Previous chunk still has {0} unread bytes")]
    UnreadChunkData(u32),
    // Writer errors.
    #[error("Minor version not supported for writing: {0}")]
    UnsupportedMinorVersion(u16),
    #[error("Chunk type cannot be written: {0:#06x}")]
    UnwritableChunkType(u16),
    #[error("Previous chunk still has {0} unwritten bytes")]
    UnwrittenChunkData(u32),
    #[error("Already wrote all chunk headers")]
    TooManyChunks,
    #[error("Gap between end of last chunk {prev_end} and start of new chunk {cur_start}")]
    GapBetweenChunks { prev_end: u32, cur_start: u32 },
    #[error("Image size {size} is not a multiple of the block size {block_size}")]
    UnalignedImage { size: u64, block_size: u32 },
    #[error("Image has too many blocks: {size} / {block_size}")]
    TooManyBlocks { size: u64, block_size: u32 },
    // Wrapped errors.
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
    #[error("I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Running out of input in the middle of a structure means the image was
/// truncated, which is a property of the image rather than an I/O failure.
fn read_error(what: &'static str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Corruption::Truncated(what).into()
    } else {
        Error::DataRead(what, e)
    }
}

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    major_version: little_endian::U16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`] plus any extension bytes.
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`] plus any extension bytes.
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> std::result::Result<(), Corruption> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Corruption::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Corruption::UnsupportedMajorVersion(
                self.major_version.get(),
            ));
        }

        if usize::from(self.file_hdr_sz.get()) < HEADER_SIZE {
            return Err(Corruption::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if usize::from(self.chunk_hdr_sz.get()) < CHUNK_HEADER_SIZE {
            return Err(Corruption::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Corruption::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }

    fn excess_raw_header_bytes(&self) -> u16 {
        self.file_hdr_sz.get() - HEADER_SIZE as u16
    }

    fn excess_raw_chunk_bytes(&self) -> u16 {
        self.chunk_hdr_sz.get() - CHUNK_HEADER_SIZE as u16
    }

    fn to_header(self) -> Header {
        Header {
            major_version: self.major_version.get(),
            minor_version: self.minor_version.get(),
            block_size: self.blk_sz.get(),
            num_blocks: self.total_blks.get(),
            num_chunks: self.total_chunks.get(),
            crc32: self.image_checksum.get(),
        }
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Types other than [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], and [`CHUNK_TYPE_CRC32`] are treated as holes.
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &format_args!("{:#06x}", self.chunk_type.get()))
            .field("reserved1", &format_args!("{:#06x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

impl RawChunk {
    /// Get the total size of the chunk for the known chunk types. Unknown chunk
    /// types may store any amount of data, so there is nothing to compare
    /// against.
    fn expected_size(
        &self,
        index: u32,
        header: &RawHeader,
    ) -> std::result::Result<Option<u32>, Corruption> {
        let data_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => self
                .chunk_sz
                .get()
                .checked_mul(header.blk_sz.get())
                .ok_or_else(|| Corruption::ChunkSizeOverflow {
                    index,
                    chunk_size: self.chunk_sz.get(),
                    block_size: header.blk_sz.get(),
                })?,
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
            CHUNK_TYPE_DONT_CARE => 0,
            _ => return Ok(None),
        };

        data_size
            .checked_add(header.chunk_hdr_sz.into())
            .map(Some)
            .ok_or(Corruption::DataSizeTooLarge { index, data_size })
    }

    fn validate(
        &self,
        index: u32,
        header: &RawHeader,
        start_block: u32,
    ) -> std::result::Result<(), Corruption> {
        let end_block = start_block
            .checked_add(self.chunk_sz.get())
            .ok_or_else(|| Corruption::BlockCountOverflow {
                index,
                start_block,
                chunk_size: self.chunk_sz.get(),
            })?;

        if end_block > header.total_blks.get() {
            return Err(Corruption::EndBlockExceedsTotal {
                index,
                end_block,
                total_blocks: header.total_blks.get(),
            });
        }

        if self.chunk_type.get() == CHUNK_TYPE_CRC32 && self.chunk_sz.get() != 0 {
            return Err(Corruption::Crc32ChunkNotEmpty {
                index,
                chunk_size: self.chunk_sz.get(),
            });
        }

        if self.total_sz.get() < u32::from(header.chunk_hdr_sz.get()) {
            return Err(Corruption::InvalidChunkSize {
                index,
                expected_size: header.chunk_hdr_sz.get().into(),
                total_size: self.total_sz.get(),
            });
        }

        Ok(())
    }

    /// Size of the data following the chunk header. Only valid after
    /// [`Self::validate`] succeeds.
    fn payload_size(&self, header: &RawHeader) -> u32 {
        self.total_sz.get() - u32::from(header.chunk_hdr_sz.get())
    }

    /// Number of payload bytes that the chunk type gives meaning to, or
    /// [`None`] for unknown chunk types. Only valid after [`Self::validate`]
    /// succeeds.
    fn defined_payload_size(
        &self,
        index: u32,
        header: &RawHeader,
    ) -> std::result::Result<Option<u32>, Corruption> {
        Ok(self
            .expected_size(index, header)?
            .map(|s| s - u32::from(header.chunk_hdr_sz.get())))
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    pub major_version: u16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data. Zero if unknown.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl Header {
    /// Size of the image when unsparsed.
    pub fn logical_size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.num_blocks)
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for ChunkBounds {
    type Item = u32;

    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// The type of data contained in a chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// The chunk is filled with raw data.
    Data,
    /// The chunk is filled with repeating patterns of the specified integer
    /// encoded in little-endian.
    Fill(u32),
    /// The chunk is a hole and does not represent useful or valid data.
    Hole,
    /// The chunk is a CRC32 checksum. This does not represent actual data but
    /// serves as a checkpoint for validating the current checksum while in the
    /// middle of the sparse file.
    Crc32(u32),
    /// The chunk has a type that AOSP does not define. Its stored data has
    /// already been skipped and its blocks read back as zeros.
    Unknown(u16),
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => f
                .debug_tuple("Crc32")
                .field(&format_args!("{checksum:#010x}"))
                .finish(),
            Self::Unknown(chunk_type) => f
                .debug_tuple("Unknown")
                .field(&format_args!("{chunk_type:#06x}"))
                .finish(),
        }
    }
}

/// A type that represents a contiguous list of blocks and the type of data or
/// metadata they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// When [`Self::data`] is [`ChunkData::Data`], this is guaranteed to not
    /// exceed the bounds of [`u32`] when multiplied by [`Header::block_size`].
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("bounds", &self.bounds)
            .field("data", &format_args!("{:?}", self.data))
            .finish()
    }
}

/// A type for computing the minimal number of chunks for storing some given
/// data. Blocks are normally added in order, but can be added in any order.
/// Adding a new chunk that overlaps an existing chunk will remove, truncate, or
/// split the existing chunk accordingly.
#[derive(Clone, Debug, Default)]
pub struct ChunkList {
    chunks: VecList<Chunk>,
    last_used: Option<Index<Chunk>>,
    size: u32,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, index: Index<Chunk>) -> Chunk {
        // Indices are only ever obtained from the list itself.
        self.chunks.get(index).copied().unwrap_or(Chunk {
            bounds: ChunkBounds { start: 0, end: 0 },
            data: ChunkData::Hole,
        })
    }

    /// Split the previous chunk if its bounds contain the specified chunk.
    fn split_prev(&mut self, index: Index<Chunk>) {
        let Some(prev_index) = self.chunks.get_previous_index(index) else {
            return;
        };

        let cur = self.get(index);
        let Some(prev) = self.chunks.get_mut(prev_index) else {
            return;
        };

        if prev.bounds.end > cur.bounds.end {
            let tail = Chunk {
                bounds: ChunkBounds {
                    start: cur.bounds.end,
                    end: prev.bounds.end,
                },
                data: prev.data,
            };

            prev.bounds.end = cur.bounds.start;
            self.chunks.insert_after(index, tail);
        }
    }

    /// Merge the chunk at the specified index with its predecessors for as long
    /// as they overlap or are compatible. Returns the index of the chunk that
    /// now contains the original chunk.
    fn merge_down(&mut self, mut index: Index<Chunk>) -> Index<Chunk> {
        while let Some(prev_index) = self.chunks.get_previous_index(index) {
            let cur = self.get(index);
            let Some(prev) = self.chunks.get_mut(prev_index) else {
                break;
            };

            if prev.bounds.end < cur.bounds.start {
                break;
            } else if cur.bounds.start <= prev.bounds.start {
                // Fully covered.
                self.chunks.remove(prev_index);
                continue;
            } else if cur.bounds.start < prev.bounds.end {
                prev.bounds.end = cur.bounds.start;
            }

            if cur.data == prev.data {
                prev.bounds.end = cur.bounds.end;
                self.chunks.remove(index);
                index = prev_index;
            }

            break;
        }

        index
    }

    /// Same as [`Self::merge_down`], but for successors.
    fn merge_up(&mut self, mut index: Index<Chunk>) -> Index<Chunk> {
        while let Some(next_index) = self.chunks.get_next_index(index) {
            let cur = self.get(index);
            let Some(next) = self.chunks.get_mut(next_index) else {
                break;
            };

            if cur.bounds.end < next.bounds.start {
                break;
            } else if cur.bounds.end >= next.bounds.end {
                // Fully covered.
                self.chunks.remove(next_index);
                continue;
            } else if cur.bounds.end > next.bounds.start {
                next.bounds.start = cur.bounds.end;
            }

            if cur.data == next.data {
                next.bounds.start = cur.bounds.start;
                self.chunks.remove(index);
                index = next_index;
            }

            break;
        }

        index
    }

    fn add_chunk(&mut self, chunk: Chunk) -> Index<Chunk> {
        self.size = self.size.max(chunk.bounds.end);

        if self.chunks.is_empty() {
            let index = self.chunks.push_back(chunk);
            self.last_used = Some(index);
            return index;
        }

        // Sequential insertion is the common case, so start searching from the
        // last chunk that was touched.
        let mut insert_before = match self.last_used {
            Some(last_used) if chunk.bounds.start >= self.get(last_used).bounds.start => {
                Some(last_used)
            }
            _ => self.chunks.front_index(),
        };

        while let Some(index) = insert_before {
            if self.get(index).bounds.start >= chunk.bounds.start {
                break;
            }

            insert_before = self.chunks.get_next_index(index);
        }

        let mut chunk_index = match insert_before {
            Some(index) => self.chunks.insert_before(index, chunk),
            None => self.chunks.push_back(chunk),
        };

        self.split_prev(chunk_index);

        chunk_index = self.merge_up(chunk_index);
        chunk_index = self.merge_down(chunk_index);

        self.last_used = Some(chunk_index);

        chunk_index
    }

    /// Insert actual data at the specified region.
    pub fn insert_data(&mut self, bounds: ChunkBounds) {
        self.add_chunk(Chunk {
            bounds,
            data: ChunkData::Data,
        });
    }

    /// Insert a fill chunk at the specified region. The fill value is encoded
    /// in little-endian.
    pub fn insert_fill(&mut self, bounds: ChunkBounds, fill_value: u32) {
        self.add_chunk(Chunk {
            bounds,
            data: ChunkData::Fill(fill_value),
        });
    }

    /// Punch a hole at the specified region. If a hole is punched at the end
    /// of the file, the file size does not decrease.
    pub fn insert_hole(&mut self, bounds: ChunkBounds) {
        let index = self.add_chunk(Chunk {
            bounds,
            data: ChunkData::Hole,
        });

        // Holes are implied by gaps.
        self.last_used = self.chunks.get_previous_index(index);
        self.chunks.remove(index);
    }

    /// Get the file size in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.size
    }

    /// Set the file size in blocks. This automatically increases when adding a
    /// new chunk beyond this bound.
    pub fn set_len(&mut self, size: u32) {
        if size < self.size {
            self.insert_hole(ChunkBounds {
                start: size,
                end: self.size,
            });
        }

        self.size = size;
    }

    /// Get the list of chunks, including all holes.
    pub fn to_chunks(&self) -> Vec<Chunk> {
        let mut result = Vec::with_capacity(self.chunks.len());
        let mut block = 0;

        for chunk in &self.chunks {
            if chunk.bounds.start != block {
                result.push(Chunk {
                    bounds: ChunkBounds {
                        start: block,
                        end: chunk.bounds.start,
                    },
                    data: ChunkData::Hole,
                });
            }

            result.push(*chunk);

            block = chunk.bounds.end;
        }

        if block != self.size {
            result.push(Chunk {
                bounds: ChunkBounds {
                    start: block,
                    end: self.size,
                },
                data: ChunkData::Hole,
            });
        }

        result
    }
}

/// Whether to validate CRC32 checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    Ignore,
}

/// Build a buffer containing the little-endian fill value repeated.
fn fill_buffer(fill_value: u32) -> [[u8; 4]; 1024] {
    [fill_value.to_le_bytes(); 1024]
}

/// Hash what a fill chunk's contents would be if it were unsparsed.
fn hash_fill(hasher: &mut Hasher, fill_value: u32, mut remain: u64) {
    let buf = fill_buffer(fill_value);
    let buf = buf.as_flattened();

    while remain > 0 {
        let n = remain.min(buf.len() as u64) as usize;
        hasher.update(&buf[..n]);
        remain -= n as u64;
    }
}

/// A type for reading sparse files. The reader must be positioned at the
/// sparse header.
pub struct SparseReader<R> {
    inner: R,
    seek_relative: Option<fn(&mut R, i64) -> io::Result<()>>,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to read.
    chunk: u32,
    /// Number of bytes left to read for the current chunk if the chunk has
    /// [`ChunkData::Data`].
    data_remain: u32,
    /// Stored bytes of the current chunk beyond what its type defines. These
    /// are skipped before the next chunk header.
    skip_remain: u32,
    /// Number of input bytes after the current chunk, if known.
    input_remain: Option<u64>,
    hasher: Option<Hasher>,
    /// Whether chunks with unexpected sizes are accepted.
    lenient: bool,
    report: Report,
}

impl<R: Read + Seek> SparseReader<R> {
    /// Create a new reader from a seekable file. This allows data chunks to be
    /// efficiently skipped without reading them and allows chunks that extend
    /// past the end of the file to be rejected before any of their data is
    /// read.
    pub fn new_seekable(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let start = inner
            .stream_position()
            .map_err(|e| Error::DataRead("position", e))?;
        let end = inner
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataRead("position", e))?;
        inner
            .seek(SeekFrom::Start(start))
            .map_err(|e| Error::DataRead("position", e))?;

        let mut result = Self::new(inner, crc_mode)?;
        result.seek_relative = Some(Seek::seek_relative);
        let header_size = u64::from(result.header.file_hdr_sz.get());
        result.input_remain = Some(end.saturating_sub(start).saturating_sub(header_size));

        Ok(result)
    }
}

impl<R: Read> SparseReader<R> {
    /// Create a new reader from a stream. This cannot efficiently skip reading
    /// data chunks if they are not needed. If the underlying file is seekable
    /// and skipping chunks is needed, use [`Self::new_seekable`] instead.
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let header = RawHeader::read_from_io(&mut inner).map_err(|e| read_error("header", e))?;

        header.validate()?;

        inner
            .read_discard_exact(header.excess_raw_header_bytes().into())
            .map_err(|e| read_error("header_excess", e))?;

        Ok(Self {
            inner,
            seek_relative: None,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            skip_remain: 0,
            input_remain: None,
            hasher: match crc_mode {
                CrcMode::Validate => Some(Hasher::new()),
                CrcMode::Ignore => None,
            },
            lenient: false,
            report: Report::new(),
        })
    }

    /// Accept chunks whose stored size does not match their type and CRC32
    /// chunks that claim to cover blocks. Stored bytes beyond what the type
    /// defines are skipped. A data chunk that stores fewer bytes than its
    /// blocks cover yields only the stored bytes. Every such chunk is recorded
    /// in the report returned by [`Self::take_report`].
    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
    }

    /// Take the warnings recorded since the last call.
    pub fn take_report(&mut self) -> Report {
        mem::take(&mut self.report)
    }

    /// Get the sparse file header.
    pub fn header(&self) -> Header {
        self.header.to_header()
    }

    /// Read the 4-byte value of a fill or CRC32 chunk. Returns [`None`] when a
    /// lenient reader finds a chunk too small to hold it. Whatever is stored
    /// is consumed either way.
    fn read_chunk_value(&mut self, stored: u32, name: &'static str) -> Result<Option<u32>> {
        if stored < 4 {
            self.inner
                .read_discard_exact(stored.into())
                .map_err(|e| read_error(name, e))?;
            return Ok(None);
        }

        let value = little_endian::U32::read_from_io(&mut self.inner)
            .map_err(|e| read_error(name, e))?;

        Ok(Some(value.get()))
    }

    /// Number of blocks covered by the chunks read so far.
    pub fn blocks_read(&self) -> u32 {
        self.block
    }

    /// Read the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully read first unless the
    /// reader is seekable and CRC validation is disabled. If the last chunk has
    /// already been read, then [`None`] is returned.
    ///
    /// For chunks with [`ChunkData::Crc32`], if CRC validation is enabled, the
    /// checksum will have already been verified. The data of chunks with
    /// [`ChunkData::Unknown`] is skipped automatically.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.data_remain != 0 {
            if let Some(seek_relative) = self.seek_relative {
                if self.hasher.is_some() {
                    return Err(Error::Crc32RandomRead);
                }

                seek_relative(&mut self.inner, self.data_remain.into())
                    .map_err(|e| Error::DataRead("data_remain", e))?;
                self.data_remain = 0;
            } else {
                return Err(Error::UnreadChunkData(self.data_remain));
            }
        }

        if self.skip_remain != 0 {
            self.inner
                .read_discard_exact(self.skip_remain.into())
                .map_err(|e| read_error("chunk_excess_data", e))?;
            self.skip_remain = 0;
        }

        if self.chunk == self.header.total_chunks.get() {
            return Ok(None);
        }

        let index = self.chunk;

        let mut raw_chunk =
            RawChunk::read_from_io(&mut self.inner).map_err(|e| read_error("chunk", e))?;

        if self.lenient
            && raw_chunk.chunk_type.get() == CHUNK_TYPE_CRC32
            && raw_chunk.chunk_sz.get() != 0
        {
            self.report.push(Warning::NonEmptyCrc32Chunk {
                index,
                blocks: raw_chunk.chunk_sz.get(),
            });
            raw_chunk.chunk_sz = 0.into();
        }

        raw_chunk.validate(index, &self.header, self.block)?;

        let payload_size = raw_chunk.payload_size(&self.header);
        let defined_size = match raw_chunk.defined_payload_size(index, &self.header)? {
            Some(size) if size != payload_size => {
                let expected_size = size + u32::from(self.header.chunk_hdr_sz.get());
                let total_size = raw_chunk.total_sz.get();

                if !self.lenient {
                    return Err(Corruption::InvalidChunkSize {
                        index,
                        expected_size,
                        total_size,
                    }
                    .into());
                }

                self.report.push(Warning::UnexpectedSparseChunkSize {
                    index,
                    expected: expected_size,
                    actual: total_size,
                });

                size.min(payload_size)
            }
            Some(size) => size,
            None => payload_size,
        };

        if let Some(remain) = self.input_remain {
            let needed = u64::from(raw_chunk.total_sz.get());
            if needed > remain {
                return Err(Corruption::ChunkPastEof {
                    index,
                    needed,
                    available: remain.saturating_sub(u64::from(self.header.chunk_hdr_sz.get())),
                }
                .into());
            }

            self.input_remain = Some(remain - needed);
        }

        self.inner
            .read_discard_exact(self.header.excess_raw_chunk_bytes().into())
            .map_err(|e| read_error("chunk_excess", e))?;

        let fill_size =
            u64::from(raw_chunk.chunk_sz.get()) * u64::from(self.header.blk_sz.get());

        let data = match raw_chunk.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                self.data_remain = defined_size;

                ChunkData::Data
            }
            CHUNK_TYPE_FILL => {
                let fill_value = self
                    .read_chunk_value(defined_size, "chunk_fill_value")?
                    .unwrap_or(0);

                if let Some(hasher) = &mut self.hasher {
                    hash_fill(hasher, fill_value, fill_size);
                }

                ChunkData::Fill(fill_value)
            }
            CHUNK_TYPE_DONT_CARE => {
                if let Some(hasher) = &mut self.hasher {
                    hash_fill(hasher, 0, fill_size);
                }

                ChunkData::Hole
            }
            CHUNK_TYPE_CRC32 => {
                let expected = self.read_chunk_value(defined_size, "chunk_crc32")?;

                if let (Some(hasher), Some(expected)) = (&self.hasher, expected) {
                    let actual = hasher.clone().finalize();

                    if actual != expected {
                        return Err(
                            Corruption::MismatchedCrc32Checkpoint { expected, actual }.into()
                        );
                    }
                }

                ChunkData::Crc32(expected.unwrap_or(0))
            }
            chunk_type => {
                self.inner
                    .read_discard_exact(payload_size.into())
                    .map_err(|e| read_error("chunk_unknown", e))?;

                if let Some(hasher) = &mut self.hasher {
                    hash_fill(hasher, 0, fill_size);
                }

                ChunkData::Unknown(chunk_type)
            }
        };

        self.skip_remain = payload_size - defined_size;

        let chunk = Chunk {
            bounds: ChunkBounds {
                start: self.block,
                end: self.block + raw_chunk.chunk_sz.get(),
            },
            data,
        };

        self.chunk += 1;
        self.block = chunk.bounds.end;

        Ok(Some(chunk))
    }

    /// Verify the final checksum and return the underlying reader.
    pub fn finish(self) -> Result<R> {
        if let Some(hasher) = self.hasher {
            let expected = self.header.image_checksum.get();
            if expected != 0 {
                let actual = hasher.finalize();

                if actual != expected {
                    return Err(Corruption::MismatchedCrc32Final { expected, actual }.into());
                }
            }
        }

        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.data_remain as usize);

        let n = self.inner.read(&mut buf[..to_read])?;

        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }

        self.data_remain -= n as u32;

        Ok(n)
    }
}

/// A type for writing sparse files.
pub struct SparseWriter<W> {
    inner: W,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to write.
    chunk: u32,
    /// Number of bytes left to write for the current chunk if the chunk has
    /// [`ChunkData::Data`].
    data_remain: u32,
    hasher: Hasher,
}

impl<W: Write> SparseWriter<W> {
    /// Create a new writer from a stream. This does not require the underlying
    /// file to be seekable, so the [`Header`] must be fully known up front.
    pub fn new(mut inner: W, header: Header) -> Result<Self> {
        if header.minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion(header.minor_version));
        }

        let header = RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: header.major_version.into(),
            minor_version: header.minor_version.into(),
            file_hdr_sz: (HEADER_SIZE as u16).into(),
            chunk_hdr_sz: (CHUNK_HEADER_SIZE as u16).into(),
            blk_sz: header.block_size.into(),
            total_blks: header.num_blocks.into(),
            total_chunks: header.num_chunks.into(),
            image_checksum: header.crc32.into(),
        };

        header.validate()?;

        header
            .write_to_io(&mut inner)
            .map_err(|e| Error::DataWrite("header", e))?;

        Ok(Self {
            inner,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            hasher: Hasher::new(),
        })
    }

    /// Write the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully written first.
    pub fn start_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if self.data_remain != 0 {
            return Err(Error::UnwrittenChunkData(self.data_remain));
        }

        if self.chunk == self.header.total_chunks.get() {
            return Err(Error::TooManyChunks);
        }

        if chunk.bounds.start != self.block {
            return Err(Error::GapBetweenChunks {
                prev_end: self.block,
                cur_start: chunk.bounds.start,
            });
        }

        let chunk_type = match chunk.data {
            ChunkData::Data => CHUNK_TYPE_RAW,
            ChunkData::Fill(_) => CHUNK_TYPE_FILL,
            ChunkData::Hole => CHUNK_TYPE_DONT_CARE,
            ChunkData::Crc32(_) => CHUNK_TYPE_CRC32,
            ChunkData::Unknown(t) => return Err(Error::UnwritableChunkType(t)),
        };

        let mut raw_chunk = RawChunk {
            chunk_type: chunk_type.into(),
            reserved1: 0.into(),
            chunk_sz: chunk.bounds.len().into(),
            total_sz: 0.into(),
        };

        // Known chunk types always have an expected size.
        raw_chunk.total_sz = raw_chunk
            .expected_size(self.chunk, &self.header)?
            .unwrap_or_default()
            .into();

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.chunk += 1;
        self.block = chunk.bounds.end;

        raw_chunk
            .write_to_io(&mut self.inner)
            .map_err(|e| Error::DataWrite("chunk", e))?;

        let fill_size = u64::from(chunk.bounds.len()) * u64::from(self.header.blk_sz.get());

        match chunk.data {
            ChunkData::Data => {
                self.data_remain = raw_chunk.payload_size(&self.header);
            }
            ChunkData::Fill(fill_value) => {
                self.inner
                    .write_all(&fill_value.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_fill_value", e))?;

                hash_fill(&mut self.hasher, fill_value, fill_size);
            }
            ChunkData::Hole => {
                hash_fill(&mut self.hasher, 0, fill_size);
            }
            ChunkData::Crc32(expected) => {
                self.inner
                    .write_all(&expected.to_le_bytes())
                    .map_err(|e| Error::DataWrite("chunk_crc32", e))?;

                let actual = self.hasher.clone().finalize();
                if actual != expected {
                    return Err(Corruption::MismatchedCrc32Checkpoint { expected, actual }.into());
                }
            }
            ChunkData::Unknown(_) => {}
        }

        Ok(())
    }

    /// Verify the final checksum and return the underlying writer.
    pub fn finish(self) -> Result<W> {
        if self.data_remain != 0 {
            return Err(Error::UnwrittenChunkData(self.data_remain));
        }

        let expected = self.header.image_checksum.get();
        if expected != 0 {
            let actual = self.hasher.finalize();

            if actual != expected {
                return Err(Corruption::MismatchedCrc32Final { expected, actual }.into());
            }
        }

        Ok(self.inner)
    }
}

impl<W: Write> Write for SparseWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let to_write = buf.len().min(self.data_remain as usize);

        let n = self.inner.write(&buf[..to_write])?;

        self.hasher.update(&buf[..n]);

        self.data_remain -= n as u32;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Result of [`classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// No valid sparse header was found. The file is used as-is.
    Raw,
    /// A valid sparse header starts at `offset`.
    Sparse { offset: u64, header: Header },
}

/// Parse and validate a header candidate at `offset`. Returns [`None`] if the
/// bytes there do not form a valid header.
fn header_at<R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
    file_len: u64,
) -> Result<Option<Header>> {
    if file_len.saturating_sub(offset) < HEADER_SIZE as u64 {
        return Ok(None);
    }

    let mut buf = [0u8; HEADER_SIZE];
    reader
        .read_exact_at(&mut buf, offset)
        .map_err(|e| read_error("header", e))?;

    let Ok(raw_header) = RawHeader::read_from_bytes(&buf) else {
        return Ok(None);
    };

    match raw_header.validate() {
        Ok(()) => Ok(Some(raw_header.to_header())),
        Err(e) => {
            debug!("Ignoring sparse magic at {offset:#x}: {e}");
            Ok(None)
        }
    }
}

/// Determine whether the data is a sparse image by searching the first
/// `scan_limit` bytes for a valid sparse header. Data before the header, such
/// as vendor-specific headers, is ignored.
pub fn classify_reader<R: ReadAt + ?Sized>(reader: &R, scan_limit: u64) -> Result<ImageKind> {
    let file_len = reader
        .file_len()
        .map_err(|e| Error::DataRead("file_len", e))?;

    if file_len < HEADER_SIZE as u64 {
        return Err(Error::UnknownImage { size: file_len });
    }

    let limit = scan_limit.min(file_len);
    let magic = HEADER_MAGIC.to_le_bytes();
    let finder = memmem::Finder::new(&magic);
    let mut buf = vec![0u8; SCAN_WINDOW.min(limit as usize)];
    let mut base = 0;

    while base < limit {
        let n = (limit - base).min(buf.len() as u64) as usize;
        reader
            .read_exact_at(&mut buf[..n], base)
            .map_err(|e| read_error("scan", e))?;

        for pos in finder.find_iter(&buf[..n]) {
            let offset = base + pos as u64;

            if let Some(header) = header_at(reader, offset, file_len)? {
                return Ok(ImageKind::Sparse { offset, header });
            }
        }

        if base + n as u64 >= limit {
            break;
        }

        // Overlap windows so that a magic straddling the boundary is found.
        base += (n - (magic.len() - 1)) as u64;
    }

    Ok(ImageKind::Raw)
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::File(path.to_owned(), e))
}

/// Determine whether a file is a sparse image. This never modifies the file.
pub fn classify(path: &Path, config: &SparseConfig) -> Result<ImageKind> {
    let file = open_input(path)?;

    classify_reader(&file, config.scan_limit)
}

/// Get the size of the image when unsparsed. For raw images, this is the file
/// size.
pub fn raw_size(path: &Path, config: &SparseConfig) -> Result<u64> {
    let file = open_input(path)?;

    match classify_reader(&file, config.scan_limit)? {
        ImageKind::Sparse { header, .. } => Ok(header.logical_size()),
        ImageKind::Raw => file.file_len().map_err(|e| Error::File(path.to_owned(), e)),
    }
}

/// Get the default output path for [`decode`]. `x.img` becomes
/// `x.unsparse.img` and any other `x` becomes `x.unsparse.img`.
pub fn unsparse_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|e| e == "img") {
        util::with_file_suffix(&path.with_extension(""), ".unsparse.img")
    } else {
        util::with_file_suffix(path, ".unsparse.img")
    }
}

/// Convert a sparse image to a raw image. The reader must be positioned at the
/// sparse header. Fill chunks, holes, and chunks of unknown types are all
/// written as zeros. Chunks whose stored size does not match their type are
/// accepted and reported as warnings, as are chunks of unknown types. If the
/// chunks cover fewer blocks than the header declares, the remainder is
/// zero-filled so that the output always has the declared size.
pub fn unsparse<R: Read + Seek, W: Write>(
    reader: R,
    mut writer: W,
    crc_mode: CrcMode,
) -> Result<(W, Report)> {
    let mut sparse_reader = SparseReader::new_seekable(reader, crc_mode)?;
    sparse_reader.set_lenient(true);

    let header = sparse_reader.header();
    let block_size = u64::from(header.block_size);
    let mut report = Report::new();
    let mut index = 0;

    debug!("Sparse header: {header:?}");

    while let Some(chunk) = sparse_reader.next_chunk()? {
        report.extend(sparse_reader.take_report());

        let size = u64::from(chunk.bounds.len()) * block_size;

        match chunk.data {
            ChunkData::Data => {
                let n = io::copy(&mut sparse_reader, &mut writer)
                    .map_err(|e| read_error("chunk_data", e))?;
                if sparse_reader.data_remain != 0 {
                    return Err(Corruption::Truncated("chunk_data").into());
                }

                // Undersized chunks store less than their blocks cover.
                writer
                    .write_zeros_exact(size - n)
                    .map_err(|e| Error::DataWrite("chunk_data_padding", e))?;
            }
            ChunkData::Fill(fill_value) => {
                if fill_value != 0 {
                    debug!(
                        "Chunk #{index}: Writing zeros in place of fill value {fill_value:#010x}"
                    );
                }

                writer
                    .write_zeros_exact(size)
                    .map_err(|e| Error::DataWrite("chunk_fill", e))?;
            }
            ChunkData::Hole => {
                writer
                    .write_zeros_exact(size)
                    .map_err(|e| Error::DataWrite("chunk_hole", e))?;
            }
            ChunkData::Crc32(_) => {}
            ChunkData::Unknown(chunk_type) => {
                report.push(Warning::UnknownSparseChunk { chunk_type, index });

                writer
                    .write_zeros_exact(size)
                    .map_err(|e| Error::DataWrite("chunk_unknown", e))?;
            }
        }

        index += 1;
    }

    let missing_blocks = header.num_blocks - sparse_reader.blocks_read();
    if missing_blocks > 0 {
        report.push(Warning::ShortSparseImage { missing_blocks });

        writer
            .write_zeros_exact(u64::from(missing_blocks) * block_size)
            .map_err(|e| Error::DataWrite("padding", e))?;
    }

    sparse_reader.finish()?;

    Ok((writer, report))
}

/// Convert the sparse image at `input` to a raw image at `output`. The output
/// file is removed if the conversion fails.
pub fn decode_to(input: &Path, output: &Path, config: &SparseConfig) -> Result<Report> {
    let mut file = open_input(input)?;

    let offset = match classify_reader(&file, config.scan_limit)? {
        ImageKind::Sparse { offset, .. } => offset,
        // Let the header validation report the problem.
        ImageKind::Raw => 0,
    };

    if offset != 0 {
        info!("Skipping {offset} bytes before sparse header");
    }

    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::File(input.to_owned(), e))?;

    let writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| Error::File(output.to_owned(), e))?;

    let result = unsparse(BufReader::new(file), BufWriter::new(writer), config.crc_mode())
        .and_then(|(writer, report)| {
            writer
                .into_inner()
                .map_err(|e| Error::DataWrite("flush", e.into_error()))?
                .sync_all()
                .map_err(|e| Error::DataWrite("flush", e))?;
            Ok(report)
        });

    if result.is_err() {
        let _ = fs::remove_file(output);
    }

    result
}

/// Convert the sparse image at `input` to a raw image next to it, named
/// according to [`unsparse_path`]. Returns the output path.
pub fn decode(input: &Path, config: &SparseConfig) -> Result<(PathBuf, Report)> {
    let output = unsparse_path(input);
    let report = decode_to(input, &output, config)?;

    Ok((output, report))
}

/// Split data chunks so that none exceed [`MAX_DATA_CHUNK_BYTES`].
fn split_chunks(chunks: &[Chunk], block_size: u32) -> Vec<Chunk> {
    let max_blocks = (MAX_DATA_CHUNK_BYTES / block_size).max(1);
    let mut result = vec![];

    for mut chunk in chunks.iter().copied() {
        if chunk.data == ChunkData::Data {
            while chunk.bounds.len() > max_blocks {
                result.push(Chunk {
                    bounds: ChunkBounds {
                        start: chunk.bounds.start,
                        end: chunk.bounds.start + max_blocks,
                    },
                    data: chunk.data,
                });

                chunk.bounds.start += max_blocks;
            }
        }

        result.push(chunk);
    }

    result
}

/// Convert a raw image to a sparse image. All-zero blocks become zero-valued
/// fill chunks and everything else is stored verbatim. Fill chunks always
/// decode to zeros, so no other fill value is ever written. The image size
/// must be a multiple of `block_size`.
pub fn pack<R: Read + Seek, W: Write>(mut reader: R, writer: W, block_size: u32) -> Result<W> {
    let size = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataRead("file_len", e))?;

    if block_size == 0 || block_size % 4 != 0 {
        return Err(Corruption::InvalidBlockSize(block_size).into());
    } else if size % u64::from(block_size) != 0 {
        return Err(Error::UnalignedImage { size, block_size });
    }

    let num_blocks = u32::try_from(size / u64::from(block_size))
        .map_err(|_| Error::TooManyBlocks { size, block_size })?;

    reader
        .rewind()
        .map_err(|e| Error::DataRead("rewind", e))?;

    let mut list = ChunkList::new();
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; block_size as usize];

    for block in 0..num_blocks {
        reader
            .read_exact(&mut buf)
            .map_err(|e| read_error("block", e))?;
        hasher.update(&buf);

        let bounds = ChunkBounds {
            start: block,
            end: block + 1,
        };

        if util::is_zero(&buf) {
            list.insert_fill(bounds, 0);
        } else {
            list.insert_data(bounds);
        }
    }

    list.set_len(num_blocks);

    let chunks = split_chunks(&list.to_chunks(), block_size);
    let header = Header {
        major_version: MAJOR_VERSION,
        minor_version: MINOR_VERSION,
        block_size,
        num_blocks,
        num_chunks: chunks.len() as u32,
        crc32: hasher.finalize(),
    };

    debug!("Packing {} chunks: {header:?}", chunks.len());

    let mut sparse_writer = SparseWriter::new(writer, header)?;

    for chunk in chunks {
        sparse_writer.start_chunk(chunk)?;

        if chunk.data == ChunkData::Data {
            let offset = u64::from(chunk.bounds.start) * u64::from(block_size);
            let len = u64::from(chunk.bounds.len()) * u64::from(block_size);

            reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::DataRead("seek", e))?;

            io::copy(&mut (&mut reader).take(len), &mut sparse_writer)
                .map_err(|e| Error::DataWrite("chunk_data", e))?;
        }
    }

    sparse_writer.finish()
}

/// Convert the raw image at `input` to a sparse image at `output`.
pub fn encode(input: &Path, output: &Path, block_size: u32) -> Result<Header> {
    let reader = open_input(input)?;

    let writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| Error::File(output.to_owned(), e))?;

    let result = pack(BufReader::new(reader), BufWriter::new(writer), block_size).and_then(
        |writer| {
            writer
                .into_inner()
                .map_err(|e| Error::DataWrite("flush", e.into_error()))?
                .sync_all()
                .map_err(|e| Error::DataWrite("flush", e))
        },
    );

    if let Err(e) = result {
        let _ = fs::remove_file(output);
        return Err(e);
    }

    // Re-read the header so the caller sees exactly what was written.
    let mut file = open_input(output)?;
    let sparse_reader = SparseReader::new(&mut file, CrcMode::Ignore)?;

    Ok(sparse_reader.header())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn fill(start: u32, end: u32, value: u32) -> Chunk {
        Chunk {
            bounds: ChunkBounds { start, end },
            data: ChunkData::Fill(value),
        }
    }

    fn hole(start: u32, end: u32) -> Chunk {
        Chunk {
            bounds: ChunkBounds { start, end },
            data: ChunkData::Hole,
        }
    }

    #[test]
    fn chunk_list_merges_adjacent() {
        let mut list = ChunkList::new();

        list.insert_fill(ChunkBounds { start: 1, end: 2 }, 0xaaaaaaaa);
        list.insert_fill(ChunkBounds { start: 0, end: 1 }, 0xaaaaaaaa);
        list.insert_fill(ChunkBounds { start: 2, end: 3 }, 0xaaaaaaaa);
        assert_eq!(list.to_chunks(), vec![fill(0, 3, 0xaaaaaaaa)]);
    }

    #[test]
    fn chunk_list_splits_and_punches() {
        let mut list = ChunkList::new();

        list.insert_fill(ChunkBounds { start: 0, end: 3 }, 0xaaaaaaaa);
        list.insert_fill(ChunkBounds { start: 1, end: 2 }, 0xbbbbbbbb);
        assert_eq!(
            list.to_chunks(),
            vec![
                fill(0, 1, 0xaaaaaaaa),
                fill(1, 2, 0xbbbbbbbb),
                fill(2, 3, 0xaaaaaaaa),
            ],
        );

        list.insert_hole(ChunkBounds { start: 1, end: 3 });
        assert_eq!(list.to_chunks(), vec![fill(0, 1, 0xaaaaaaaa), hole(1, 3)]);
        assert_eq!(list.len(), 3);

        list.set_len(0);
        assert_eq!(list.to_chunks(), vec![]);
    }

    fn raw_header_bytes(
        file_hdr_sz: u16,
        block_size: u32,
        total_blocks: u32,
        total_chunks: u32,
    ) -> Vec<u8> {
        RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: MAJOR_VERSION.into(),
            minor_version: MINOR_VERSION.into(),
            file_hdr_sz: file_hdr_sz.into(),
            chunk_hdr_sz: (CHUNK_HEADER_SIZE as u16).into(),
            blk_sz: block_size.into(),
            total_blks: total_blocks.into(),
            total_chunks: total_chunks.into(),
            image_checksum: 0.into(),
        }
        .as_bytes()
        .to_vec()
    }

    fn raw_chunk_bytes(chunk_type: u16, chunk_sz: u32, total_sz: u32) -> Vec<u8> {
        RawChunk {
            chunk_type: chunk_type.into(),
            reserved1: 0.into(),
            chunk_sz: chunk_sz.into(),
            total_sz: total_sz.into(),
        }
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn classify_finds_offset_header() {
        let mut data = vec![0x55u8; 100];
        // A stray magic that is not followed by a valid header.
        data[10..14].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        data.extend(raw_header_bytes(28, 4096, 1, 0));

        let kind = classify_reader(&data, 1024).unwrap();
        assert_matches!(kind, ImageKind::Sparse { offset: 100, header } => {
            assert_eq!(header.logical_size(), 4096);
        });

        // Classification has no state.
        assert_eq!(classify_reader(&data, 1024).unwrap(), kind);

        // Header is beyond the scan limit.
        assert_eq!(classify_reader(&data, 64).unwrap(), ImageKind::Raw);
    }

    #[test]
    fn classify_small_file() {
        assert_matches!(
            classify_reader(&vec![0u8; 27], 1024),
            Err(Error::UnknownImage { size: 27 })
        );
        assert_eq!(classify_reader(&vec![0u8; 28], 1024).unwrap(), ImageKind::Raw);
    }

    #[test]
    fn unsparse_extended_header_and_fill() {
        let mut data = raw_header_bytes(32, 8, 3, 2);
        data.extend([0xffu8; 4]);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_FILL, 2, 16));
        data.extend(0x01020304u32.to_le_bytes());
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 1, 20));
        data.extend(b"abcdefgh");

        let (output, report) =
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore).unwrap();

        assert!(report.is_empty());
        assert_eq!(&output[..16], [0u8; 16]);
        assert_eq!(&output[16..], b"abcdefgh");
    }

    #[test]
    fn unsparse_skips_oversized_chunks() {
        let mut data = raw_header_bytes(28, 4, 3, 3);
        // Hole with 4 stray bytes.
        data.extend(raw_chunk_bytes(CHUNK_TYPE_DONT_CARE, 1, 16));
        data.extend([0x11u8; 4]);
        // Data with 2 stray bytes.
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 1, 18));
        data.extend(b"wxyz!!");
        // Fill with 4 stray bytes.
        data.extend(raw_chunk_bytes(CHUNK_TYPE_FILL, 1, 20));
        data.extend(0xffffffffu32.to_le_bytes());
        data.extend([0x22u8; 4]);

        let (output, report) =
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore).unwrap();

        assert_eq!(output, b"\0\0\0\0wxyz\0\0\0\0");
        assert_eq!(
            report.warnings(),
            [
                Warning::UnexpectedSparseChunkSize {
                    index: 0,
                    expected: 12,
                    actual: 16,
                },
                Warning::UnexpectedSparseChunkSize {
                    index: 1,
                    expected: 16,
                    actual: 18,
                },
                Warning::UnexpectedSparseChunkSize {
                    index: 2,
                    expected: 16,
                    actual: 20,
                },
            ],
        );
    }

    #[test]
    fn unsparse_pads_undersized_data_chunk() {
        let mut data = raw_header_bytes(28, 4, 3, 2);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 2, 14));
        data.extend(b"ab");
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 1, 16));
        data.extend(b"wxyz");

        let (output, report) =
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore).unwrap();

        assert_eq!(output, b"ab\0\0\0\0\0\0wxyz");
        assert_eq!(
            report.warnings(),
            [Warning::UnexpectedSparseChunkSize {
                index: 0,
                expected: 20,
                actual: 14,
            }],
        );
    }

    #[test]
    fn strict_reader_rejects_oversized_chunks() {
        let mut data = raw_header_bytes(28, 4, 1, 1);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_DONT_CARE, 1, 16));
        data.extend([0u8; 4]);

        let mut reader = SparseReader::new(Cursor::new(data), CrcMode::Ignore).unwrap();

        assert_matches!(
            reader.next_chunk(),
            Err(Error::CorruptSparseImage(Corruption::InvalidChunkSize {
                index: 0,
                expected_size: 12,
                total_size: 16,
            }))
        );
    }

    #[test]
    fn unsparse_unknown_chunk_is_zeroed() {
        let mut data = raw_header_bytes(28, 4, 2, 2);
        data.extend(raw_chunk_bytes(0xcac5, 1, 14));
        data.extend([0xee, 0xee]);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 1, 16));
        data.extend(b"wxyz");

        let (output, report) =
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore).unwrap();

        assert_eq!(output, b"\0\0\0\0wxyz");
        assert_eq!(
            report.warnings(),
            [Warning::UnknownSparseChunk {
                chunk_type: 0xcac5,
                index: 0,
            }],
        );
    }

    #[test]
    fn unsparse_pads_short_image() {
        let mut data = raw_header_bytes(28, 4, 3, 1);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 1, 16));
        data.extend(b"wxyz");

        let (output, report) =
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore).unwrap();

        assert_eq!(output, b"wxyz\0\0\0\0\0\0\0\0");
        assert_eq!(
            report.warnings(),
            [Warning::ShortSparseImage { missing_blocks: 2 }],
        );
    }

    #[test]
    fn unsparse_rejects_truncation() {
        let mut data = raw_header_bytes(28, 4, 2, 1);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_RAW, 2, 20));
        data.extend(b"wxyz");

        assert_matches!(
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore),
            Err(Error::CorruptSparseImage(Corruption::ChunkPastEof {
                index: 0,
                needed: 20,
                ..
            }))
        );

        let mut data = raw_header_bytes(28, 4, 2, 2);
        data.extend(raw_chunk_bytes(CHUNK_TYPE_DONT_CARE, 1, 12));

        assert_matches!(
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore),
            Err(Error::CorruptSparseImage(Corruption::Truncated("chunk")))
        );
    }

    #[test]
    fn unsparse_rejects_bad_magic() {
        let mut data = raw_header_bytes(28, 4, 1, 0);
        data[0] = 0;

        assert_matches!(
            unsparse(Cursor::new(data), Vec::new(), CrcMode::Ignore),
            Err(Error::CorruptSparseImage(Corruption::InvalidMagic(_)))
        );
    }

    #[test]
    fn pack_classifies_blocks() {
        let mut raw = vec![0u8; 4 * 16];
        raw[16..32].copy_from_slice(&[0xab; 16]);
        raw[32..48].copy_from_slice(b"0123456789abcdef");
        raw[48..64].copy_from_slice(b"fedcba9876543210");

        let sparse = pack(Cursor::new(&raw), Vec::new(), 16).unwrap();

        let mut reader = SparseReader::new(Cursor::new(&sparse), CrcMode::Validate).unwrap();
        assert_eq!(reader.header().num_chunks, 2);

        let mut chunks = vec![];
        while let Some(chunk) = reader.next_chunk().unwrap() {
            if chunk.data == ChunkData::Data {
                io::copy(&mut reader, &mut io::sink()).unwrap();
            }
            chunks.push(chunk);
        }
        reader.finish().unwrap();

        assert_eq!(
            chunks,
            vec![
                fill(0, 1, 0),
                Chunk {
                    bounds: ChunkBounds { start: 1, end: 4 },
                    data: ChunkData::Data,
                },
            ],
        );

        let (unsparsed, _) =
            unsparse(Cursor::new(sparse), Vec::new(), CrcMode::Validate).unwrap();
        assert_eq!(unsparsed, raw);
    }

    #[test]
    fn pack_rejects_unaligned() {
        assert_matches!(
            pack(Cursor::new(vec![1u8; 10]), Vec::new(), 4),
            Err(Error::UnalignedImage {
                size: 10,
                block_size: 4,
            })
        );
    }

    #[test]
    fn output_naming() {
        assert_eq!(
            unsparse_path(Path::new("dir/system.img")),
            Path::new("dir/system.unsparse.img"),
        );
        assert_eq!(
            unsparse_path(Path::new("dir/super")),
            Path::new("dir/super.unsparse.img"),
        );
    }
}
