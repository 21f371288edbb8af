/*
 * SPDX-FileCopyrightText: 2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Builds small single-group ext4 images with 1 KiB blocks for tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

pub const BLOCK_SIZE: usize = 1024;
pub const INODE_SIZE: usize = 512;
pub const INODE_COUNT: u32 = 64;
pub const ROOT_INODE: u32 = 2;
pub const LOST_FOUND_INODE: u32 = 11;

const FIRST_DATA_BLOCK: usize = 1;
const INODE_TABLE_BLOCK: usize = 5;
const EXTRA_ISIZE: usize = 32;
const XATTR_MAGIC: u32 = 0xea020000;
const INCOMPAT_FILETYPE: u32 = 0x2;
const INCOMPAT_EXTENTS: u32 = 0x40;
const INODE_FLAG_EXTENTS: u32 = 0x80000;

pub const XATTR_INDEX_SECURITY: u8 = 6;

/// How file data blocks are recorded in inodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Extents,
    BlockMap,
}

enum Content {
    Dir(Vec<(Vec<u8>, u32, u8)>),
    File(Vec<u8>),
    Symlink(Vec<u8>),
    /// Device node with no data.
    Special,
}

struct Node {
    mode: u16,
    uid: u16,
    gid: u16,
    parent: u32,
    content: Content,
    inline_xattrs: Vec<(u8, Vec<u8>, Vec<u8>)>,
    block_xattrs: Vec<(u8, Vec<u8>, Vec<u8>)>,
}

pub struct ImageBuilder {
    layout: Layout,
    label: Vec<u8>,
    nodes: BTreeMap<u32, Node>,
    next_inode: u32,
    file_types: bool,
}

fn file_type(mode: u16) -> u8 {
    match mode & 0o170000 {
        0o100000 => 1,
        0o040000 => 2,
        0o020000 => 3,
        0o060000 => 4,
        0o010000 => 5,
        0o140000 => 6,
        0o120000 => 7,
        _ => 0,
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Serialize xattr entries followed by a 4-byte terminator, with the values
/// packed at the end of `region`. Value offsets are relative to `base`.
fn write_xattrs(
    region: &mut [u8],
    entries_start: usize,
    base: usize,
    xattrs: &[(u8, Vec<u8>, Vec<u8>)],
) {
    let mut entry = entries_start;
    let mut value_end = region.len();

    for (index, name, value) in xattrs {
        value_end = (value_end - value.len()) & !3;
        region[value_end..value_end + value.len()].copy_from_slice(value);

        region[entry] = name.len() as u8;
        region[entry + 1] = *index;
        put_u16(region, entry + 2, (value_end - base) as u16);
        put_u32(region, entry + 4, 0);
        put_u32(region, entry + 8, value.len() as u32);
        region[entry + 16..entry + 16 + name.len()].copy_from_slice(name);

        entry += (16 + name.len()).next_multiple_of(4);
    }

    assert!(entry + 4 <= value_end, "xattrs do not fit");
}

/// Build the on-disk directory entries. Entries never cross block boundaries
/// and the last entry of each block extends to the end of the block.
fn dir_blocks(entries: &[(Vec<u8>, u32, u8)]) -> Vec<u8> {
    fn finish(block: &mut Vec<u8>, last_offset: &mut Option<usize>, data: &mut Vec<u8>) {
        if let Some(last) = last_offset.take() {
            let rec_len = BLOCK_SIZE - last;
            put_u16(block, last + 4, rec_len as u16);
            block.resize(BLOCK_SIZE, 0);
            data.append(block);
        }
    }

    let mut data = vec![];
    let mut block = vec![];
    let mut last_offset = None;

    for (name, inode, file_type) in entries {
        let rec_len = (8 + name.len()).next_multiple_of(4);
        if block.len() + rec_len > BLOCK_SIZE {
            finish(&mut block, &mut last_offset, &mut data);
        }

        let offset = block.len();
        block.resize(offset + rec_len, 0);
        put_u32(&mut block, offset, *inode);
        put_u16(&mut block, offset + 4, rec_len as u16);
        block[offset + 6] = name.len() as u8;
        block[offset + 7] = *file_type;
        block[offset + 8..offset + 8 + name.len()].copy_from_slice(name);

        last_offset = Some(offset);
    }

    finish(&mut block, &mut last_offset, &mut data);

    data
}

impl ImageBuilder {
    pub fn new(layout: Layout) -> Self {
        let mut builder = Self {
            layout,
            label: b"test".to_vec(),
            nodes: BTreeMap::new(),
            next_inode: LOST_FOUND_INODE,
            file_types: true,
        };

        builder.nodes.insert(
            ROOT_INODE,
            Node {
                mode: 0o040755,
                uid: 0,
                gid: 0,
                parent: ROOT_INODE,
                content: Content::Dir(vec![]),
                inline_xattrs: vec![],
                block_xattrs: vec![],
            },
        );

        let lost_found = builder.dir(ROOT_INODE, "lost+found", 0o700, 0, 0);
        assert_eq!(lost_found, LOST_FOUND_INODE);

        builder
    }

    /// Leave out the file type from directory records, like ext2 without the
    /// `filetype` feature.
    pub fn without_file_types(&mut self) -> &mut Self {
        self.file_types = false;
        self
    }

    pub fn label(&mut self, label: &str) -> &mut Self {
        self.label = label.as_bytes().to_vec();
        self
    }

    fn add(
        &mut self,
        parent: u32,
        name: &[u8],
        mode: u16,
        uid: u16,
        gid: u16,
        content: Content,
    ) -> u32 {
        let inode = self.next_inode;
        self.next_inode += 1;
        assert!(inode <= INODE_COUNT, "too many inodes");

        self.push_child(parent, name, inode, mode);

        self.nodes.insert(
            inode,
            Node {
                mode,
                uid,
                gid,
                parent,
                content,
                inline_xattrs: vec![],
                block_xattrs: vec![],
            },
        );

        inode
    }

    pub fn dir(&mut self, parent: u32, name: &str, perms: u16, uid: u16, gid: u16) -> u32 {
        self.add(parent, name.as_bytes(), 0o040000 | perms, uid, gid, Content::Dir(vec![]))
    }

    pub fn file(
        &mut self,
        parent: u32,
        name: &str,
        perms: u16,
        uid: u16,
        gid: u16,
        data: &[u8],
    ) -> u32 {
        self.add(
            parent,
            name.as_bytes(),
            0o100000 | perms,
            uid,
            gid,
            Content::File(data.to_vec()),
        )
    }

    /// Targets shorter than 60 bytes are stored in the inode.
    pub fn symlink(&mut self, parent: u32, name: &str, target: &[u8]) -> u32 {
        self.add(parent, name.as_bytes(), 0o120777, 0, 0, Content::Symlink(target.to_vec()))
    }

    pub fn char_device(&mut self, parent: u32, name: &str) -> u32 {
        self.add(parent, name.as_bytes(), 0o020600, 0, 0, Content::Special)
    }

    /// Add a hard link to an existing inode.
    pub fn link(&mut self, parent: u32, name: &str, inode: u32) {
        let mode = self.nodes[&inode].mode;

        self.push_child(parent, name.as_bytes(), inode, mode);
    }

    fn push_child(&mut self, parent: u32, name: &[u8], inode: u32, mode: u16) {
        match &mut self.nodes.get_mut(&parent).expect("parent exists").content {
            Content::Dir(children) => children.push((name.to_vec(), inode, file_type(mode))),
            _ => panic!("parent is not a directory"),
        }
    }

    /// Store an xattr inside the inode.
    pub fn xattr(&mut self, inode: u32, index: u8, name: &str, value: &[u8]) -> &mut Self {
        let node = self.nodes.get_mut(&inode).expect("inode exists");
        node.inline_xattrs.push((index, name.as_bytes().to_vec(), value.to_vec()));
        self
    }

    /// Store an xattr in a separate xattr block.
    pub fn block_xattr(&mut self, inode: u32, index: u8, name: &str, value: &[u8]) -> &mut Self {
        let node = self.nodes.get_mut(&inode).expect("inode exists");
        node.block_xattrs.push((index, name.as_bytes().to_vec(), value.to_vec()));
        self
    }

    pub fn selinux(&mut self, inode: u32, context: &str) -> &mut Self {
        let mut value = context.as_bytes().to_vec();
        value.push(0);
        self.xattr(inode, XATTR_INDEX_SECURITY, "selinux", &value)
    }

    pub fn build(&self) -> Vec<u8> {
        let inode_table_blocks = INODE_COUNT as usize * INODE_SIZE / BLOCK_SIZE;
        let mut image = vec![0u8; (INODE_TABLE_BLOCK + inode_table_blocks) * BLOCK_SIZE];

        for (&number, node) in &self.nodes {
            let data = match &node.content {
                Content::Dir(children) => {
                    let mut entries = vec![
                        (b".".to_vec(), number, 2),
                        (b"..".to_vec(), node.parent, 2),
                    ];
                    entries.extend(children.iter().cloned());
                    if !self.file_types {
                        for entry in &mut entries {
                            entry.2 = 0;
                        }
                    }
                    dir_blocks(&entries)
                }
                Content::File(data) => data.clone(),
                Content::Symlink(target) if target.len() >= 60 => target.clone(),
                Content::Symlink(_) | Content::Special => vec![],
            };

            let mut raw = vec![0u8; INODE_SIZE];
            let mut sectors = 0u32;

            put_u16(&mut raw, 0, node.mode);
            put_u16(&mut raw, 2, node.uid);
            put_u16(&mut raw, 24, node.gid);
            put_u16(&mut raw, 26, 1);

            let size = match &node.content {
                Content::Symlink(target) => target.len(),
                _ => data.len(),
            };
            put_u32(&mut raw, 4, size as u32);

            match &node.content {
                Content::Symlink(target) if target.len() < 60 => {
                    raw[40..40 + target.len()].copy_from_slice(target);
                }
                Content::Special => {}
                _ if !data.is_empty() => {
                    let (start, count, extra) = self.write_data(&mut image, &data);
                    sectors += ((count + extra) * BLOCK_SIZE / 512) as u32;
                    self.map_blocks(&mut raw, &mut image, start, count);
                }
                _ => {
                    if self.layout == Layout::Extents {
                        self.map_blocks(&mut raw, &mut image, 0, 0);
                    }
                }
            }

            if !node.block_xattrs.is_empty() {
                let block = image.len() / BLOCK_SIZE;
                let mut data = vec![0u8; BLOCK_SIZE];
                put_u32(&mut data, 0, XATTR_MAGIC);
                put_u32(&mut data, 4, 1);
                put_u32(&mut data, 8, 1);
                write_xattrs(&mut data, 32, 0, &node.block_xattrs);
                image.extend(data);

                put_u32(&mut raw, 104, block as u32);
                sectors += (BLOCK_SIZE / 512) as u32;
            }

            put_u32(&mut raw, 28, sectors);

            put_u16(&mut raw, 128, EXTRA_ISIZE as u16);
            if !node.inline_xattrs.is_empty() {
                let region = &mut raw[128 + EXTRA_ISIZE..];
                put_u32(region, 0, XATTR_MAGIC);
                write_xattrs(region, 4, 4, &node.inline_xattrs);
            }

            let offset = INODE_TABLE_BLOCK * BLOCK_SIZE + (number as usize - 1) * INODE_SIZE;
            image[offset..offset + INODE_SIZE].copy_from_slice(&raw);
        }

        let blocks_count = image.len() / BLOCK_SIZE;

        let sb = &mut image[1024..2048];
        put_u32(sb, 0, INODE_COUNT);
        put_u32(sb, 4, blocks_count as u32);
        put_u32(sb, 20, FIRST_DATA_BLOCK as u32);
        put_u32(sb, 24, 0);
        put_u32(sb, 32, 8192);
        put_u32(sb, 40, INODE_COUNT);
        put_u16(sb, 56, 0xef53);
        put_u32(sb, 76, 1);
        put_u16(sb, 88, INODE_SIZE as u16);
        let mut incompat = if self.file_types {
            INCOMPAT_FILETYPE
        } else {
            0
        };
        if self.layout == Layout::Extents {
            incompat |= INCOMPAT_EXTENTS;
        }
        put_u32(sb, 96, incompat);
        sb[120..120 + self.label.len()].copy_from_slice(&self.label);

        let gdt = &mut image[(FIRST_DATA_BLOCK + 1) * BLOCK_SIZE..];
        put_u32(gdt, 8, INODE_TABLE_BLOCK as u32);

        image
    }

    /// Append `data` as contiguous blocks. Block maps need an indirect block
    /// after the data for files over 12 blocks. Returns the first data block,
    /// the data block count, and the number of extra metadata blocks.
    fn write_data(&self, image: &mut Vec<u8>, data: &[u8]) -> (usize, usize, usize) {
        let start = image.len() / BLOCK_SIZE;
        let count = data.len().div_ceil(BLOCK_SIZE);

        image.extend(data);
        image.resize((start + count) * BLOCK_SIZE, 0);

        let extra = if self.layout == Layout::BlockMap && count > 12 {
            assert!(count <= 12 + BLOCK_SIZE / 4, "file too large");
            1
        } else {
            0
        };

        (start, count, extra)
    }

    fn map_blocks(&self, raw: &mut [u8], image: &mut Vec<u8>, start: usize, count: usize) {
        match self.layout {
            Layout::Extents => {
                put_u32(raw, 32, INODE_FLAG_EXTENTS);

                let i_block = &mut raw[40..100];
                put_u16(i_block, 0, 0xf30a);
                put_u16(i_block, 2, u16::from(count != 0));
                put_u16(i_block, 4, 4);
                put_u16(i_block, 6, 0);

                if count != 0 {
                    put_u32(i_block, 12, 0);
                    put_u16(i_block, 16, count as u16);
                    put_u16(i_block, 18, 0);
                    put_u32(i_block, 20, start as u32);
                }
            }
            Layout::BlockMap => {
                for i in 0..count.min(12) {
                    put_u32(raw, 40 + i * 4, (start + i) as u32);
                }

                if count > 12 {
                    let indirect = image.len() / BLOCK_SIZE;
                    let mut block = vec![0u8; BLOCK_SIZE];
                    for i in 12..count {
                        put_u32(&mut block, (i - 12) * 4, (start + i) as u32);
                    }
                    image.extend(block);

                    put_u32(raw, 40 + 12 * 4, indirect as u32);
                }
            }
        }
    }
}
