// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Read-only ext2/3/4 reader. Only the structures needed to walk the directory
//! tree, read file contents, and read extended attributes are implemented. The
//! journal is never replayed, so images should be cleanly unmounted.

use std::{
    fmt,
    io::{self, Read},
};

use bitflags::bitflags;
use bstr::BString;
use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::debug;
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    extract::{DirEntry, EntryKind, Metadata, Volume, VolumeInfo, Xattr},
    stream::{FileLen, ReadAt},
};

/// Byte offset of the superblock, regardless of the block size.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Magic value for [`RawSuperblock::magic`].
pub const SUPERBLOCK_MAGIC: u16 = 0xef53;
/// The root directory is always inode 2.
pub const ROOT_INODE: u64 = 2;

const EXTENT_MAGIC: u16 = 0xf30a;
/// The kernel never creates deeper trees.
const MAX_EXTENT_DEPTH: u16 = 5;
/// Extents longer than this are uninitialized and read as zeros.
const EXTENT_INIT_MAX_LEN: u16 = 32768;

const XATTR_MAGIC: u32 = 0xea020000;
const XATTR_BLOCK_HEADER_SIZE: usize = 32;
const XATTR_ENTRY_SIZE: usize = 16;
const XATTR_INLINE_DATA: &str = "system.data";

const GOOD_OLD_INODE_SIZE: u16 = 128;
const DIR_ENTRY_HEADER_SIZE: usize = 8;
/// Size of `i_block` in bytes. Fast symlinks and inline data live here.
const INODE_BLOCK_SIZE: usize = 60;
const DIRECT_BLOCKS: usize = 12;

const S_IFMT: u16 = 0o170000;
const S_IFSOCK: u16 = 0o140000;
const S_IFLNK: u16 = 0o120000;
const S_IFREG: u16 = 0o100000;
const S_IFBLK: u16 = 0o060000;
const S_IFDIR: u16 = 0o040000;
const S_IFCHR: u16 = 0o020000;
const S_IFIFO: u16 = 0o010000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid superblock magic: {0:#06x}")]
    InvalidMagic(u16),
    #[error("Unsupported block size: 1024 << {0}")]
    InvalidBlockSize(u32),
    #[error("Invalid inode size: {0}")]
    InvalidInodeSize(u16),
    #[error("Invalid group descriptor size: {0}")]
    InvalidDescriptorSize(u16),
    #[error("Invalid filesystem geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("Unsupported incompatible features: {0:?}")]
    UnsupportedFeatures(IncompatFeatures),
    #[error("Inode #{0} is out of range")]
    InodeOutOfRange(u64),
    #[error("Inode #{inode}: {reason}")]
    CorruptInode { inode: u64, reason: &'static str },
    #[error("Inode #{inode}: corrupt directory entry at offset {offset}")]
    CorruptDirEntry { inode: u64, offset: usize },
    #[error("Inode #{inode}: corrupt extended attributes: {reason}")]
    CorruptXattr { inode: u64, reason: &'static str },
    #[error("Inode #{0} is not a directory")]
    NotADirectory(u64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to read filesystem data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const FILETYPE = 0x2;
        /// The journal needs recovery. The image is read as-is.
        const RECOVER = 0x4;
        const JOURNAL_DEV = 0x8;
        const META_BG = 0x10;
        const EXTENTS = 0x40;
        const BIT64 = 0x80;
        const MMP = 0x100;
        const FLEX_BG = 0x200;
        const EA_INODE = 0x400;
        const DIRDATA = 0x1000;
        const CSUM_SEED = 0x2000;
        const LARGEDIR = 0x4000;
        const INLINE_DATA = 0x8000;
        const ENCRYPT = 0x10000;
        const CASEFOLD = 0x20000;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        /// Hashed directory. The leaf blocks are still valid linear
        /// directories.
        const INDEX = 0x1000;
        const HUGE_FILE = 0x40000;
        const EXTENTS = 0x80000;
        const EA_INODE = 0x200000;
        const INLINE_DATA = 0x10000000;

        const _ = !0;
    }
}

impl IncompatFeatures {
    const SUPPORTED: Self = Self::FILETYPE
        .union(Self::RECOVER)
        .union(Self::EXTENTS)
        .union(Self::BIT64)
        .union(Self::MMP)
        .union(Self::FLEX_BG)
        .union(Self::EA_INODE)
        .union(Self::CSUM_SEED)
        .union(Self::LARGEDIR)
        .union(Self::INLINE_DATA)
        .union(Self::ENCRYPT)
        .union(Self::CASEFOLD);
}

/// Raw on-disk layout for the superblock. Only the fields needed for reading
/// are named.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSuperblock {
    inodes_count: little_endian::U32,
    blocks_count_lo: little_endian::U32,
    _counts: [u8; 12],
    first_data_block: little_endian::U32,
    log_block_size: little_endian::U32,
    _log_cluster_size: [u8; 4],
    blocks_per_group: little_endian::U32,
    _clusters_per_group: [u8; 4],
    inodes_per_group: little_endian::U32,
    _times: [u8; 12],
    magic: little_endian::U16,
    _state: [u8; 18],
    rev_level: little_endian::U32,
    _def_resuid: [u8; 8],
    inode_size: little_endian::U16,
    _block_group_nr: [u8; 2],
    feature_compat: little_endian::U32,
    feature_incompat: little_endian::U32,
    feature_ro_compat: little_endian::U32,
    _uuid: [u8; 16],
    volume_name: [u8; 16],
    _last_mounted: [u8; 64],
    _misc: [u8; 54],
    desc_size: little_endian::U16,
    _mount: [u8; 80],
    blocks_count_hi: little_endian::U32,
    _reserved: [u8; 684],
}

impl fmt::Debug for RawSuperblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSuperblock")
            .field("inodes_count", &self.inodes_count.get())
            .field("blocks_count_lo", &self.blocks_count_lo.get())
            .field("first_data_block", &self.first_data_block.get())
            .field("log_block_size", &self.log_block_size.get())
            .field("blocks_per_group", &self.blocks_per_group.get())
            .field("inodes_per_group", &self.inodes_per_group.get())
            .field("magic", &format_args!("{:#06x}", self.magic.get()))
            .field("rev_level", &self.rev_level.get())
            .field("inode_size", &self.inode_size.get())
            .field("feature_compat", &format_args!("{:#x}", self.feature_compat.get()))
            .field("feature_incompat", &format_args!("{:#x}", self.feature_incompat.get()))
            .field("feature_ro_compat", &format_args!("{:#x}", self.feature_ro_compat.get()))
            .field("volume_name", &BString::from(&self.volume_name[..]))
            .field("desc_size", &self.desc_size.get())
            .field("blocks_count_hi", &self.blocks_count_hi.get())
            .finish_non_exhaustive()
    }
}

impl RawSuperblock {
    fn validate(&self) -> Result<Superblock> {
        if self.magic.get() != SUPERBLOCK_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        let incompat = IncompatFeatures::from_bits_retain(self.feature_incompat.get());
        let unsupported = incompat.difference(IncompatFeatures::SUPPORTED);
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedFeatures(unsupported));
        }

        let log_block_size = self.log_block_size.get();
        if log_block_size > 6 {
            return Err(Error::InvalidBlockSize(log_block_size));
        }
        let block_size = 1024u32 << log_block_size;

        let inode_size = if self.rev_level.get() == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size.get()
        };
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || u32::from(inode_size) > block_size
        {
            return Err(Error::InvalidInodeSize(inode_size));
        }

        let desc_size = if incompat.contains(IncompatFeatures::BIT64) {
            self.desc_size.get()
        } else {
            32
        };
        if desc_size < 32 || !desc_size.is_power_of_two() || u32::from(desc_size) > block_size {
            return Err(Error::InvalidDescriptorSize(desc_size));
        }

        let mut blocks_count = u64::from(self.blocks_count_lo.get());
        if incompat.contains(IncompatFeatures::BIT64) {
            blocks_count |= u64::from(self.blocks_count_hi.get()) << 32;
        }

        let first_data_block = self.first_data_block.get();
        if u64::from(first_data_block) >= blocks_count {
            return Err(Error::InvalidGeometry("first data block is past the end"));
        } else if self.blocks_per_group.get() == 0 {
            return Err(Error::InvalidGeometry("zero blocks per group"));
        } else if self.inodes_per_group.get() == 0 {
            return Err(Error::InvalidGeometry("zero inodes per group"));
        }

        let label = self
            .volume_name
            .split(|b| *b == 0)
            .next()
            .unwrap_or_default();

        Ok(Superblock {
            inodes_count: self.inodes_count.get(),
            blocks_count,
            first_data_block,
            block_size,
            blocks_per_group: self.blocks_per_group.get(),
            inodes_per_group: self.inodes_per_group.get(),
            inode_size,
            desc_size,
            incompat,
            label: label.into(),
        })
    }
}

/// Validated superblock fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub desc_size: u16,
    pub incompat: IncompatFeatures,
    pub label: BString,
}

impl Superblock {
    pub fn group_count(&self) -> u64 {
        (self.blocks_count - u64::from(self.first_data_block))
            .div_ceil(self.blocks_per_group.into())
    }
}

/// First half of a group descriptor. The 32-byte form has nothing else.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGroupDesc {
    _bitmaps_lo: [u8; 8],
    inode_table_lo: little_endian::U32,
    _rest_lo: [u8; 20],
}

/// Second half of a 64-byte group descriptor.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGroupDescHi {
    _bitmaps_hi: [u8; 8],
    inode_table_hi: little_endian::U32,
    _rest_hi: [u8; 20],
}

/// The base 128-byte inode. Larger inodes have `i_extra_isize` and in-inode
/// extended attributes after this.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawInode {
    mode: little_endian::U16,
    uid: little_endian::U16,
    size_lo: little_endian::U32,
    _times: [u8; 16],
    gid: little_endian::U16,
    links_count: little_endian::U16,
    blocks_lo: little_endian::U32,
    flags: little_endian::U32,
    _osd1: [u8; 4],
    block: [u8; INODE_BLOCK_SIZE],
    _generation: [u8; 4],
    file_acl_lo: little_endian::U32,
    size_high: little_endian::U32,
    _obso_faddr: [u8; 4],
    _blocks_high: [u8; 2],
    file_acl_high: little_endian::U16,
    uid_high: little_endian::U16,
    gid_high: little_endian::U16,
    _checksum: [u8; 4],
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtentHeader {
    magic: little_endian::U16,
    entries: little_endian::U16,
    _max: little_endian::U16,
    depth: little_endian::U16,
    _generation: little_endian::U32,
}

/// Leaf node entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    block: little_endian::U32,
    len: little_endian::U16,
    start_hi: little_endian::U16,
    start_lo: little_endian::U32,
}

/// Interior node entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtentIdx {
    _block: little_endian::U32,
    leaf_lo: little_endian::U32,
    leaf_hi: little_endian::U16,
    _unused: little_endian::U16,
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawDirEntry {
    inode: little_endian::U32,
    rec_len: little_endian::U16,
    name_len: u8,
    /// High byte of the name length if the filesystem lacks
    /// [`IncompatFeatures::FILETYPE`].
    file_type: u8,
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawXattrEntry {
    name_len: u8,
    name_index: u8,
    value_offs: little_endian::U16,
    value_inum: little_endian::U32,
    value_size: little_endian::U32,
    _hash: little_endian::U32,
}

fn xattr_prefix(index: u8) -> &'static str {
    match index {
        1 => "user.",
        2 => "system.posix_acl_access",
        3 => "system.posix_acl_default",
        4 => "trusted.",
        6 => "security.",
        7 => "system.",
        8 => "system.richacl",
        _ => "",
    }
}

/// A parsed inode.
#[derive(Clone, Debug)]
pub struct Inode {
    pub number: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub flags: InodeFlags,
    blocks_lo: u32,
    file_acl: u64,
    block: [u8; INODE_BLOCK_SIZE],
    /// Everything after the base inode, starting with `i_extra_isize`.
    extra: Vec<u8>,
}

impl Inode {
    pub fn kind(&self) -> EntryKind {
        match self.mode & S_IFMT {
            S_IFDIR => EntryKind::Dir,
            S_IFREG => EntryKind::File,
            S_IFLNK => EntryKind::Symlink,
            S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => EntryKind::Other,
            _ => EntryKind::Other,
        }
    }

    /// Fast symlinks store the target in `i_block` and own no data blocks
    /// aside from an xattr block.
    fn is_fast_symlink(&self, block_size: u32) -> bool {
        if self.mode & S_IFMT != S_IFLNK || self.flags.contains(InodeFlags::INLINE_DATA) {
            return false;
        }

        if self.flags.contains(InodeFlags::EA_INODE) {
            return self.size != 0 && self.size < INODE_BLOCK_SIZE as u64;
        }

        let ea_blocks = if self.file_acl != 0 { block_size >> 9 } else { 0 };

        self.blocks_lo == ea_blocks
    }
}

/// Maps a contiguous run of logical blocks to physical blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mapping {
    logical: u64,
    physical: u64,
    len: u64,
    uninit: bool,
}

impl Mapping {
    fn logical_end(&self) -> u64 {
        self.logical.saturating_add(self.len)
    }
}

#[derive(Clone, Debug)]
enum FileData {
    Inline(Vec<u8>),
    Mapped(Vec<Mapping>),
}

/// Collects block map pointers into coalesced [`Mapping`]s.
struct BlockMapBuilder {
    mappings: Vec<Mapping>,
    /// Number of data blocks that may still be mapped. A real file cannot have
    /// more data blocks than the image.
    budget: u64,
}

impl BlockMapBuilder {
    fn push(&mut self, inode: u64, logical: u64, physical: u32) -> Result<()> {
        if physical == 0 {
            return Ok(());
        }

        self.budget = self.budget.checked_sub(1).ok_or(Error::CorruptInode {
            inode,
            reason: "block map references more blocks than the image",
        })?;

        let physical = u64::from(physical);

        if let Some(last) = self.mappings.last_mut()
            && last.logical_end() == logical
            && last.physical + last.len == physical
        {
            last.len += 1;
        } else {
            self.mappings.push(Mapping {
                logical,
                physical,
                len: 1,
                uninit: false,
            });
        }

        Ok(())
    }
}

/// A read-only ext2/3/4 volume backed by any [`ReadAt`] source.
pub struct Ext4Volume<R> {
    reader: R,
    superblock: Superblock,
    /// Starting block of each group's inode table.
    inode_tables: Vec<u64>,
    image_size: u64,
}

impl<R> fmt::Debug for Ext4Volume<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext4Volume")
            .field("superblock", &self.superblock)
            .field("inode_tables", &self.inode_tables.len())
            .field("image_size", &self.image_size)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt> Ext4Volume<R> {
    pub fn new(reader: R) -> Result<Self> {
        let image_size = reader
            .file_len()
            .map_err(|e| Error::DataRead("image_size", e))?;

        let mut raw = RawSuperblock::new_zeroed();
        reader
            .read_exact_at(raw.as_mut_bytes(), SUPERBLOCK_OFFSET)
            .map_err(|e| Error::DataRead("superblock", e))?;

        let superblock = raw.validate()?;
        debug!("Superblock: {raw:?}");

        let group_count = superblock.group_count();
        let desc_size = u64::from(superblock.desc_size);
        let block_size = u64::from(superblock.block_size);

        let table_size = group_count
            .checked_mul(desc_size)
            .filter(|s| *s <= image_size)
            .ok_or(Error::InvalidGeometry("group descriptor table exceeds image"))?;
        let table_offset = (u64::from(superblock.first_data_block) + 1) * block_size;

        let table_size = table_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("table_size"))?;
        let mut table = vec![0u8; table_size];
        reader
            .read_exact_at(&mut table, table_offset)
            .map_err(|e| Error::DataRead("group_descriptors", e))?;

        let is_64bit = superblock.desc_size >= 64;
        let mut inode_tables = Vec::with_capacity(table.len() / usize::from(superblock.desc_size));

        for desc in table.chunks_exact(superblock.desc_size.into()) {
            let (lo, rest) = RawGroupDesc::read_from_prefix(desc)
                .map_err(|_| Error::InvalidGeometry("truncated group descriptor"))?;
            let mut inode_table = u64::from(lo.inode_table_lo.get());

            if is_64bit {
                let (hi, _) = RawGroupDescHi::read_from_prefix(rest)
                    .map_err(|_| Error::InvalidGeometry("truncated group descriptor"))?;
                inode_table |= u64::from(hi.inode_table_hi.get()) << 32;
            }

            inode_tables.push(inode_table);
        }

        Ok(Self {
            reader,
            superblock,
            inode_tables,
            image_size,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn block_size(&self) -> u64 {
        self.superblock.block_size.into()
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let offset = block
            .checked_mul(self.block_size())
            .ok_or(Error::IntegerTooLarge("block_offset"))?;
        let mut buf = vec![0u8; self.superblock.block_size as usize];

        self.reader
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::DataRead("block", e))?;

        Ok(buf)
    }

    pub fn inode(&self, number: u64) -> Result<Inode> {
        if number == 0 || number > u64::from(self.superblock.inodes_count) {
            return Err(Error::InodeOutOfRange(number));
        }

        let index = number - 1;
        let inodes_per_group = u64::from(self.superblock.inodes_per_group);
        let inode_size = u64::from(self.superblock.inode_size);

        let table = self
            .inode_tables
            .get((index / inodes_per_group).to_usize().ok_or(Error::InodeOutOfRange(number))?)
            .ok_or(Error::InodeOutOfRange(number))?;
        let offset = table
            .checked_mul(self.block_size())
            .and_then(|o| o.checked_add((index % inodes_per_group) * inode_size))
            .ok_or(Error::IntegerTooLarge("inode_offset"))?;

        let mut buf = vec![0u8; self.superblock.inode_size.into()];
        self.reader
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::DataRead("inode", e))?;

        let (raw, extra) = RawInode::read_from_prefix(&buf).map_err(|_| Error::CorruptInode {
            inode: number,
            reason: "truncated inode",
        })?;

        Ok(Inode {
            number,
            mode: raw.mode.get(),
            uid: u32::from(raw.uid.get()) | (u32::from(raw.uid_high.get()) << 16),
            gid: u32::from(raw.gid.get()) | (u32::from(raw.gid_high.get()) << 16),
            size: u64::from(raw.size_lo.get()) | (u64::from(raw.size_high.get()) << 32),
            links_count: raw.links_count.get(),
            flags: InodeFlags::from_bits_retain(raw.flags.get()),
            blocks_lo: raw.blocks_lo.get(),
            file_acl: u64::from(raw.file_acl_lo.get()) | (u64::from(raw.file_acl_high.get()) << 32),
            block: raw.block,
            extra: extra.to_vec(),
        })
    }

    fn extent_mappings(&self, inode: &Inode) -> Result<Vec<Mapping>> {
        let mut mappings = vec![];
        self.walk_extent_node(inode.number, &inode.block, None, &mut mappings)?;
        mappings.sort_by_key(|m| m.logical);

        Ok(mappings)
    }

    fn walk_extent_node(
        &self,
        inode: u64,
        node: &[u8],
        expected_depth: Option<u16>,
        mappings: &mut Vec<Mapping>,
    ) -> Result<()> {
        let corrupt = |reason| Error::CorruptInode { inode, reason };

        let (header, entries) = RawExtentHeader::read_from_prefix(node)
            .map_err(|_| corrupt("truncated extent header"))?;
        if header.magic.get() != EXTENT_MAGIC {
            return Err(corrupt("invalid extent header magic"));
        }

        let depth = header.depth.get();
        if depth > MAX_EXTENT_DEPTH || expected_depth.is_some_and(|d| d != depth) {
            return Err(corrupt("invalid extent tree depth"));
        }

        let count = usize::from(header.entries.get());
        if count * 12 > entries.len() {
            return Err(corrupt("too many extent entries"));
        }

        for entry in entries.chunks_exact(12).take(count) {
            if depth == 0 {
                let extent =
                    RawExtent::read_from_bytes(entry).map_err(|_| corrupt("truncated extent"))?;
                let mut len = extent.len.get();
                let uninit = len > EXTENT_INIT_MAX_LEN;
                if uninit {
                    len -= EXTENT_INIT_MAX_LEN;
                }

                mappings.push(Mapping {
                    logical: extent.block.get().into(),
                    physical: (u64::from(extent.start_hi.get()) << 32)
                        | u64::from(extent.start_lo.get()),
                    len: len.into(),
                    uninit,
                });
            } else {
                let index = RawExtentIdx::read_from_bytes(entry)
                    .map_err(|_| corrupt("truncated extent index"))?;
                let leaf =
                    (u64::from(index.leaf_hi.get()) << 32) | u64::from(index.leaf_lo.get());
                let block = self.read_block(leaf)?;

                self.walk_extent_node(inode, &block, Some(depth - 1), mappings)?;
            }
        }

        Ok(())
    }

    fn block_map_mappings(&self, inode: &Inode) -> Result<Vec<Mapping>> {
        let needed = inode.size.div_ceil(self.block_size());
        let pointers = <[little_endian::U32]>::ref_from_bytes(&inode.block).map_err(|_| {
            Error::CorruptInode {
                inode: inode.number,
                reason: "invalid block map",
            }
        })?;

        let mut builder = BlockMapBuilder {
            mappings: vec![],
            budget: self.image_size / self.block_size(),
        };
        let mut logical = 0;

        for pointer in &pointers[..DIRECT_BLOCKS] {
            if logical >= needed {
                break;
            }
            builder.push(inode.number, logical, pointer.get())?;
            logical += 1;
        }

        for (level, pointer) in (1..).zip(&pointers[DIRECT_BLOCKS..]) {
            if logical >= needed {
                break;
            }

            self.walk_indirect(
                inode.number,
                pointer.get(),
                level,
                &mut logical,
                needed,
                &mut builder,
            )?;
        }

        Ok(builder.mappings)
    }

    /// Number of logical blocks covered by an indirect block at `level`.
    fn indirect_span(&self, level: u32) -> u64 {
        (self.block_size() / 4).saturating_pow(level)
    }

    fn walk_indirect(
        &self,
        inode: u64,
        block: u32,
        level: u32,
        logical: &mut u64,
        needed: u64,
        builder: &mut BlockMapBuilder,
    ) -> Result<()> {
        if block == 0 {
            *logical = logical.saturating_add(self.indirect_span(level));
            return Ok(());
        }

        let data = self.read_block(block.into())?;
        let pointers = <[little_endian::U32]>::ref_from_bytes(&data).map_err(|_| {
            Error::CorruptInode {
                inode,
                reason: "invalid indirect block",
            }
        })?;

        for pointer in pointers {
            if *logical >= needed {
                break;
            }

            if level == 1 {
                builder.push(inode, *logical, pointer.get())?;
                *logical += 1;
            } else {
                self.walk_indirect(inode, pointer.get(), level - 1, logical, needed, builder)?;
            }
        }

        Ok(())
    }

    fn file_data(&self, inode: &Inode) -> Result<FileData> {
        if inode.flags.contains(InodeFlags::INLINE_DATA) {
            let mut data = inode.block.to_vec();
            if let Some(xattr) = self
                .inode_xattrs(inode)?
                .into_iter()
                .find(|x| x.name == XATTR_INLINE_DATA)
            {
                data.extend(xattr.value);
            }

            Ok(FileData::Inline(data))
        } else if inode.is_fast_symlink(self.superblock.block_size) {
            let len = inode.size.min(INODE_BLOCK_SIZE as u64) as usize;
            Ok(FileData::Inline(inode.block[..len].to_vec()))
        } else if inode.flags.contains(InodeFlags::EXTENTS) {
            self.extent_mappings(inode).map(FileData::Mapped)
        } else {
            self.block_map_mappings(inode).map(FileData::Mapped)
        }
    }

    /// Open an inode's contents for reading.
    pub fn open_inode(&self, inode: &Inode) -> Result<FileReader<'_, R>> {
        Ok(FileReader {
            volume: self,
            data: self.file_data(inode)?,
            size: inode.size,
            pos: 0,
        })
    }

    /// Read the full contents of a small inode, such as a directory.
    fn read_small(&self, inode: &Inode, size: u64, what: &'static str) -> Result<Vec<u8>> {
        if size > self.image_size {
            return Err(Error::CorruptInode {
                inode: inode.number,
                reason: "size exceeds image",
            });
        }

        let mut data = vec![];
        self.open_inode(inode)?
            .take(size)
            .read_to_end(&mut data)
            .map_err(|e| Error::DataRead(what, e))?;

        Ok(data)
    }

    pub fn read_dir(&self, number: u64) -> Result<Vec<DirEntry>> {
        let inode = self.inode(number)?;
        if inode.kind() != EntryKind::Dir {
            return Err(Error::NotADirectory(number));
        }

        let mut entries = vec![];

        if inode.flags.contains(InodeFlags::INLINE_DATA) {
            // The first 4 bytes hold the parent inode instead of `.` and `..`.
            let (parent, dirents) = little_endian::U32::read_from_prefix(&inode.block)
                .map_err(|_| Error::CorruptDirEntry {
                    inode: number,
                    offset: 0,
                })?;

            entries.push(DirEntry {
                name: ".".into(),
                node: number,
                kind: Some(EntryKind::Dir),
            });
            entries.push(DirEntry {
                name: "..".into(),
                node: parent.get().into(),
                kind: Some(EntryKind::Dir),
            });

            self.parse_dirents(number, dirents, &mut entries)?;

            if let Some(xattr) = self
                .inode_xattrs(&inode)?
                .into_iter()
                .find(|x| x.name == XATTR_INLINE_DATA)
            {
                self.parse_dirents(number, &xattr.value, &mut entries)?;
            }
        } else {
            let data = self.read_small(&inode, inode.size, "directory")?;
            self.parse_dirents(number, &data, &mut entries)?;
        }

        Ok(entries)
    }

    fn parse_dirents(&self, inode: u64, data: &[u8], entries: &mut Vec<DirEntry>) -> Result<()> {
        let has_file_type = self.superblock.incompat.contains(IncompatFeatures::FILETYPE);
        let mut offset = 0;

        while offset + DIR_ENTRY_HEADER_SIZE <= data.len() {
            let corrupt = Error::CorruptDirEntry { inode, offset };

            let (raw, _) = RawDirEntry::read_from_prefix(&data[offset..])
                .map_err(|_| Error::CorruptDirEntry { inode, offset })?;

            let rec_len = match raw.rec_len.get() {
                0 | 65535 if self.superblock.block_size == 65536 => 65536,
                n => usize::from(n),
            };
            if rec_len < DIR_ENTRY_HEADER_SIZE || rec_len % 4 != 0 || offset + rec_len > data.len()
            {
                return Err(corrupt);
            }

            let name_len = if has_file_type {
                usize::from(raw.name_len)
            } else {
                usize::from(raw.name_len) | (usize::from(raw.file_type) << 8)
            };
            if DIR_ENTRY_HEADER_SIZE + name_len > rec_len {
                return Err(corrupt);
            }

            let node = u64::from(raw.inode.get());

            if node != 0 && name_len != 0 {
                let name_start = offset + DIR_ENTRY_HEADER_SIZE;
                let name = &data[name_start..name_start + name_len];

                // Left for the caller to find out from the inode.
                let kind = match (has_file_type, raw.file_type) {
                    (true, 1) => Some(EntryKind::File),
                    (true, 2) => Some(EntryKind::Dir),
                    (true, 3..=6) => Some(EntryKind::Other),
                    (true, 7) => Some(EntryKind::Symlink),
                    _ => None,
                };

                entries.push(DirEntry {
                    name: name.into(),
                    node,
                    kind,
                });
            }

            offset += rec_len;
        }

        Ok(())
    }

    /// Extended attributes stored inside the inode, after `i_extra_isize`.
    fn inode_xattrs(&self, inode: &Inode) -> Result<Vec<Xattr>> {
        let mut xattrs = vec![];

        let Ok((extra_isize, _)) = little_endian::U16::read_from_prefix(&inode.extra) else {
            return Ok(xattrs);
        };

        let Some(region) = inode.extra.get(usize::from(extra_isize.get())..) else {
            return Err(Error::CorruptXattr {
                inode: inode.number,
                reason: "extra inode size exceeds inode",
            });
        };

        if let Ok((magic, entries)) = little_endian::U32::read_from_prefix(region)
            && magic.get() == XATTR_MAGIC
        {
            self.parse_xattrs(inode.number, entries, entries, &mut xattrs)?;
        }

        Ok(xattrs)
    }

    pub fn xattrs(&self, inode: &Inode) -> Result<Vec<Xattr>> {
        let mut xattrs = self.inode_xattrs(inode)?;

        if inode.file_acl != 0 {
            let block = self.read_block(inode.file_acl)?;

            let (magic, _) = little_endian::U32::read_from_prefix(&block).map_err(|_| {
                Error::CorruptXattr {
                    inode: inode.number,
                    reason: "truncated xattr block",
                }
            })?;
            if magic.get() != XATTR_MAGIC {
                return Err(Error::CorruptXattr {
                    inode: inode.number,
                    reason: "invalid xattr block magic",
                });
            }

            let entries = block.get(XATTR_BLOCK_HEADER_SIZE..).unwrap_or_default();
            self.parse_xattrs(inode.number, entries, &block, &mut xattrs)?;
        }

        Ok(xattrs)
    }

    /// Parse xattr entries. Value offsets are relative to `values`.
    fn parse_xattrs(
        &self,
        inode: u64,
        entries: &[u8],
        values: &[u8],
        xattrs: &mut Vec<Xattr>,
    ) -> Result<()> {
        let corrupt = |reason| Error::CorruptXattr { inode, reason };
        let mut offset = 0;

        loop {
            let rest = entries.get(offset..).unwrap_or_default();
            if rest.len() < 4 || rest[..4] == [0u8; 4] {
                break;
            }

            let (raw, name_data) =
                RawXattrEntry::read_from_prefix(rest).map_err(|_| corrupt("truncated entry"))?;

            let name_len = usize::from(raw.name_len);
            let name = name_data
                .get(..name_len)
                .ok_or_else(|| corrupt("name exceeds region"))?;

            let mut full_name = BString::from(xattr_prefix(raw.name_index));
            full_name.extend_from_slice(name);

            let value_size = raw
                .value_size
                .get()
                .to_usize()
                .ok_or(Error::IntegerTooLarge("value_size"))?;
            let value_inum = raw.value_inum.get();

            let value = if value_inum != 0 {
                let ea_inode = self.inode(value_inum.into())?;
                self.read_small(&ea_inode, value_size as u64, "xattr_value")?
            } else {
                let start = usize::from(raw.value_offs.get());
                values
                    .get(start..start + value_size)
                    .ok_or_else(|| corrupt("value exceeds region"))?
                    .to_vec()
            };

            xattrs.push(Xattr {
                name: full_name,
                value,
            });

            offset += (XATTR_ENTRY_SIZE + name_len).next_multiple_of(4);
        }

        Ok(())
    }
}

/// Streams an inode's contents. Holes and uninitialized extents read as zeros.
pub struct FileReader<'a, R> {
    volume: &'a Ext4Volume<R>,
    data: FileData,
    size: u64,
    pos: u64,
}

impl<R> fmt::Debug for FileReader<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("data", &self.data)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt> Read for FileReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size - self.pos;
        let to_read = buf.len().min(remaining.to_usize().unwrap_or(usize::MAX));
        if to_read == 0 {
            return Ok(0);
        }

        let buf = &mut buf[..to_read];
        let block_size = self.volume.block_size();

        let n = match &self.data {
            FileData::Inline(data) => {
                // Inline data shorter than the file size is zero padded.
                let available = self
                    .pos
                    .to_usize()
                    .and_then(|p| data.get(p..))
                    .unwrap_or_default();
                let n = available.len().min(to_read);

                if n == 0 {
                    buf.fill(0);
                    to_read
                } else {
                    buf[..n].copy_from_slice(&available[..n]);
                    n
                }
            }
            FileData::Mapped(mappings) => {
                let block = self.pos / block_size;
                let index = mappings.partition_point(|m| m.logical_end() <= block);

                match mappings.get(index) {
                    Some(m) if m.logical <= block => {
                        let run_end = m.logical_end().saturating_mul(block_size);
                        let n = (run_end - self.pos).min(to_read as u64) as usize;

                        if m.uninit {
                            buf[..n].fill(0);
                        } else {
                            let offset = (m.physical + (block - m.logical))
                                .checked_mul(block_size)
                                .and_then(|o| o.checked_add(self.pos % block_size))
                                .ok_or_else(|| {
                                    io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "Physical block offset overflow",
                                    )
                                })?;

                            self.volume.reader.read_exact_at(&mut buf[..n], offset)?;
                        }

                        n
                    }
                    next => {
                        let hole_end =
                            next.map_or(self.size, |m| m.logical.saturating_mul(block_size));
                        let n = (hole_end - self.pos).min(to_read as u64) as usize;
                        buf[..n].fill(0);
                        n
                    }
                }
            }
        };

        self.pos += n as u64;

        Ok(n)
    }
}

impl<R: ReadAt> Volume for Ext4Volume<R> {
    type Error = Error;
    type File<'a>
        = FileReader<'a, R>
    where
        Self: 'a;

    fn info(&self) -> VolumeInfo {
        VolumeInfo {
            inode_count: self.superblock.inodes_count,
            block_size: self.superblock.block_size,
            blocks_per_group: self.superblock.blocks_per_group,
            label: self.superblock.label.to_string(),
            fs_type: "ext4".to_owned(),
            image_size: self.image_size,
        }
    }

    fn block_size(&self) -> u64 {
        self.block_size()
    }

    fn root(&self) -> u64 {
        ROOT_INODE
    }

    fn read_dir(&self, node: u64) -> Result<Vec<DirEntry>> {
        self.read_dir(node)
    }

    fn metadata(&self, node: u64) -> Result<Metadata> {
        let inode = self.inode(node)?;

        Ok(Metadata {
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode,
            size: inode.size,
            kind: inode.kind(),
        })
    }

    fn open(&self, node: u64) -> Result<Self::File<'_>> {
        let inode = self.inode(node)?;
        self.open_inode(&inode)
    }

    fn xattrs(&self, node: u64) -> Result<Vec<Xattr>> {
        let inode = self.inode(node)?;
        self.xattrs(&inode)
    }

    fn read_raw(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if offset.saturating_add(len) > self.image_size {
            return Err(Error::DataRead(
                "raw",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Read of {len} bytes at {offset} exceeds image"),
                ),
            ));
        }

        let mut buf = vec![0u8; len.to_usize().ok_or(Error::IntegerTooLarge("len"))?];
        self.reader
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::DataRead("raw", e))?;

        Ok(buf)
    }
}
