// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Derives the `fs_config` and `file_contexts` metadata needed to rebuild a
//! filesystem image, and copies the filesystem's contents to the host.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use bstr::{BString, ByteSlice};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::ExtractConfig,
    report::{Report, Warning},
    util,
};

const SELINUX_XATTR: &str = "security.selinux";
const CAPABILITY_XATTR: &str = "security.capability";
/// Entries with this suffix are duplicates created by case-insensitive hosts.
const DUPLICATE_SUFFIX: &str = " (2)";
const CONTEXT_SPECIAL_CHARS: &str = "\\^$.|?*+(){}[]";
const VENDOR_GID: u32 = 2000;
const SYMLINK_MARKER: &[u8] = b"!<symlink>";

const S_IFMT: u16 = 0o170000;
const S_IFSOCK: u16 = 0o140000;
const S_IFLNK: u16 = 0o120000;
const S_IFREG: u16 = 0o100000;
const S_IFBLK: u16 = 0o060000;
const S_IFDIR: u16 = 0o040000;
const S_IFCHR: u16 = 0o020000;
const S_IFIFO: u16 = 0o010000;
const S_ISUID: u16 = 0o4000;
const S_ISGID: u16 = 0o2000;
const S_ISVTX: u16 = 0o1000;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition name: {0:?}")]
    InvalidPartitionName(String),
    #[error("Failed to read root directory")]
    RootDirectory(#[source] BoxError),
    #[error("Failed to serialize volume info")]
    Serialize(#[source] serde_json::Error),
    #[error("I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Device nodes, FIFOs, and sockets.
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: BString,
    pub node: u64,
    /// [`None`] if the directory record does not say. [`Volume::metadata`]
    /// always knows.
    pub kind: Option<EntryKind>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u32,
    /// Full `st_mode`, including the file type bits.
    pub mode: u16,
    pub size: u64,
    pub kind: EntryKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xattr {
    /// Full name, including the namespace prefix.
    pub name: BString,
    pub value: Vec<u8>,
}

/// Volume summary written to `<partition>_info.txt`. The short key names are
/// what repacking tools expect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    #[serde(rename = "a")]
    pub inode_count: u32,
    #[serde(rename = "b")]
    pub block_size: u32,
    #[serde(rename = "c")]
    pub blocks_per_group: u32,
    #[serde(rename = "d")]
    pub label: String,
    #[serde(rename = "e")]
    pub fs_type: String,
    #[serde(rename = "s")]
    pub image_size: u64,
}

impl VolumeInfo {
    /// Serialize as JSON with 4-space indentation.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = vec![];
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;

        Ok(buf)
    }
}

/// Tree-walk access to a filesystem. Nodes are identified by inode number.
pub trait Volume {
    type Error: std::error::Error + Send + Sync + 'static;
    type File<'a>: Read
    where
        Self: 'a;

    fn info(&self) -> VolumeInfo;

    fn block_size(&self) -> u64;

    fn root(&self) -> u64;

    /// List a directory in on-disk order, including `.` and `..`.
    fn read_dir(&self, node: u64) -> std::result::Result<Vec<DirEntry>, Self::Error>;

    fn metadata(&self, node: u64) -> std::result::Result<Metadata, Self::Error>;

    /// Open a file or symlink for reading its contents.
    fn open(&self, node: u64) -> std::result::Result<Self::File<'_>, Self::Error>;

    fn xattrs(&self, node: u64) -> std::result::Result<Vec<Xattr>, Self::Error>;

    /// Read raw bytes from the underlying image.
    fn read_raw(&self, offset: u64, len: u64) -> std::result::Result<Vec<u8>, Self::Error>;
}

/// Metadata for a single filesystem entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsEntry {
    /// Path relative to the partition root, starting with `/`.
    pub path: String,
    pub node: u64,
    pub uid: u32,
    pub gid: u32,
    /// Octal permissions, including the special bits (eg. `4755`).
    pub mode: String,
    pub capabilities: Option<u128>,
    pub selinux_context: Option<String>,
    /// Set if and only if `kind` is [`EntryKind::Symlink`].
    pub symlink_target: Option<String>,
    pub kind: EntryKind,
}

impl FsEntry {
    /// Path with the partition name prepended, as used in the artifacts.
    fn partition_path(&self, partition: &str) -> String {
        format!("{partition}{}", self.path)
    }

    fn host_path(&self, out_dir: &Path) -> PathBuf {
        let relative = self
            .path
            .trim_start_matches('/')
            .replace(' ', "_")
            .replace('"', "");

        out_dir.join(relative)
    }
}

/// Render an inode mode the way `ls -l` does, eg. `drwxr-xr-x`.
pub fn mode_string(mode: u16) -> String {
    let mut result = String::with_capacity(10);

    result.push(match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFREG => '-',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        _ => '?',
    });

    for (shift, special, special_char) in [(6, S_ISUID, 's'), (3, S_ISGID, 's'), (0, S_ISVTX, 't')]
    {
        let bits = (mode >> shift) & 0o7;

        result.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        result.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        result.push(match (mode & special != 0, bits & 0o1 != 0) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }

    result
}

/// Convert a 9- or 10-character `ls -l` permission string to the 4-digit
/// octal form. The leading file type character is ignored.
pub fn encode_permissions(perms: &str) -> Option<String> {
    let chars = perms.chars().collect::<Vec<_>>();
    let bits = match chars.len() {
        9 => &chars[..],
        10 => &chars[1..],
        _ => return None,
    };

    let mut special = 0;
    let mut digits = [0u8; 3];

    for (i, triple) in bits.chunks_exact(3).enumerate() {
        let special_bit = 4 >> i;
        let (set, unset) = if i == 2 { ('t', 'T') } else { ('s', 'S') };

        if triple[0] == 'r' {
            digits[i] += 4;
        }
        if triple[1] == 'w' {
            digits[i] += 2;
        }

        match triple[2] {
            'x' => digits[i] += 1,
            c if c == set => {
                digits[i] += 1;
                special += special_bit;
            }
            c if c == unset => special += special_bit,
            _ => {}
        }
    }

    Some(format!("{special}{}{}{}", digits[0], digits[1], digits[2]))
}

/// Compute the `capabilities=` value from a `security.capability` record. The
/// record is a list of little-endian `u32`s: the magic/revision word followed
/// by permitted and inheritable pairs. The value is formed by concatenating
/// words as hex digits, each padded to at least four digits: the high
/// permitted word, then the low inheritable word (only when the low permitted
/// word fits in 16 bits), then the low permitted word. Words wider than four
/// digits are not truncated, so this is not a bitwise combination. Records
/// shorter than four words have no value.
pub fn decode_capability(value: &[u8]) -> Option<u128> {
    let words = value
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();

    let [_, permitted_lo, inheritable_lo, permitted_hi, ..] = words[..] else {
        return None;
    };

    let digits = if permitted_lo > 0xffff {
        format!("{permitted_hi:04x}{permitted_lo:04x}")
    } else {
        format!("{permitted_hi:04x}{inheritable_lo:04x}{permitted_lo:04x}")
    };

    // At most 20 digits.
    u128::from_str_radix(&digits, 16).ok()
}

/// Decode a `security.selinux` value, dropping the trailing NUL terminators.
pub fn decode_context(value: &[u8]) -> String {
    let end = value.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    value[..end].to_str_lossy().into_owned()
}

/// Escape regex metacharacters for a `file_contexts` path.
pub fn escape_context_path(path: &str) -> String {
    let mut result = String::with_capacity(path.len());

    for c in path.chars() {
        if CONTEXT_SPECIAL_CHARS.contains(c) {
            result.push('\\');
        }
        result.push(c);
    }

    result
}

/// Derive the partition name from an image path: `system.img` and
/// `system.unsparse.img` both become `system`.
pub fn partition_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = name.split(".img").next()?;
    let name = name.split(".unsparse").next()?;

    if util::is_safe_component(name) {
        Some(name.to_owned())
    } else {
        None
    }
}

/// A directory entry waiting to be inspected.
struct Pending {
    path: String,
    dirent: DirEntry,
}

fn push_children<V: Volume>(
    volume: &V,
    node: u64,
    parent: &str,
    stack: &mut Vec<Pending>,
) -> std::result::Result<(), V::Error> {
    let children = volume.read_dir(node)?;

    // Reversed so that entries are popped in on-disk order.
    for dirent in children.into_iter().rev() {
        let name = dirent.name.to_str_lossy();
        if name.is_empty() || name == "." || name == ".." || name.ends_with(DUPLICATE_SUFFIX) {
            continue;
        }

        stack.push(Pending {
            path: format!("{parent}/{name}"),
            dirent,
        });
    }

    Ok(())
}

fn read_symlink<V: Volume>(
    volume: &V,
    node: u64,
    size: u64,
) -> std::result::Result<String, BoxError> {
    let mut data = vec![];
    volume.open(node)?.read_to_end(&mut data)?;

    match String::from_utf8(data) {
        Ok(target) => Ok(target),
        Err(e) => {
            // Some images store a little-endian block pointer instead.
            let bytes = e.into_bytes();
            let mut pointer = [0u8; 8];
            let n = bytes.len().min(pointer.len());
            pointer[..n].copy_from_slice(&bytes[..n]);

            let offset = u64::from_le_bytes(pointer)
                .checked_mul(volume.block_size())
                .ok_or("Symlink block pointer overflows")?;
            let data = volume.read_raw(offset, size)?;

            Ok(String::from_utf8(data)?)
        }
    }
}

fn inspect<V: Volume>(
    volume: &V,
    pending: &Pending,
    report: &mut Report,
) -> std::result::Result<FsEntry, BoxError> {
    let node = pending.dirent.node;

    let name = pending.dirent.name.to_str_lossy();
    if !util::is_safe_component(&name) {
        return Err(format!("Unsafe file name: {name:?}").into());
    }

    let metadata = volume.metadata(node)?;
    let mode = encode_permissions(&mode_string(metadata.mode)).ok_or("Invalid permissions")?;

    let mut capabilities = None;
    let mut selinux_context = None;

    for xattr in volume.xattrs(node)? {
        if xattr.name == SELINUX_XATTR {
            selinux_context = Some(decode_context(&xattr.value));
        } else if xattr.name == CAPABILITY_XATTR {
            capabilities = decode_capability(&xattr.value);
            if capabilities.is_none() {
                report.push(Warning::InvalidCapability {
                    path: pending.path.clone(),
                    size: xattr.value.len(),
                });
            }
        }
    }

    let symlink_target = if metadata.kind == EntryKind::Symlink {
        Some(read_symlink(volume, node, metadata.size)?)
    } else {
        None
    };

    Ok(FsEntry {
        path: pending.path.clone(),
        node,
        uid: metadata.uid,
        gid: metadata.gid,
        mode,
        capabilities,
        selinux_context,
        symlink_target,
        kind: metadata.kind,
    })
}

/// Walk the volume depth-first in pre-order, calling `visit` for each entry as
/// soon as it is read. A directory is visited before its children are listed.
/// Entries that cannot be read are recorded in `report` and skipped. Only
/// failing to list the root directory is fatal.
pub fn walk_with<V: Volume>(
    volume: &V,
    report: &mut Report,
    mut visit: impl FnMut(&FsEntry, &mut Report),
) -> Result<Vec<FsEntry>> {
    let root = volume.root();
    let mut visited = HashSet::from([root]);
    let mut entries = vec![];
    let mut stack = vec![];

    push_children(volume, root, "", &mut stack).map_err(|e| Error::RootDirectory(e.into()))?;

    while let Some(pending) = stack.pop() {
        let entry = match inspect(volume, &pending, report) {
            Ok(e) => e,
            Err(e) => {
                report.push(Warning::ExtractionEntryFailure {
                    path: pending.path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if entry.kind == EntryKind::Dir && !visited.insert(entry.node) {
            report.push(Warning::ExtractionEntryFailure {
                path: entry.path,
                reason: format!("Directory inode #{} was already visited", entry.node),
            });
            continue;
        }

        debug!("{} {} {} {}", entry.path, entry.uid, entry.gid, entry.mode);

        visit(&entry, report);

        if entry.kind == EntryKind::Dir
            && let Err(e) = push_children(volume, entry.node, &entry.path, &mut stack)
        {
            report.push(Warning::ExtractionEntryFailure {
                path: entry.path.clone(),
                reason: e.to_string(),
            });
        }

        entries.push(entry);
    }

    Ok(entries)
}

/// Same as [`walk_with`], but only collects the entries.
pub fn walk<V: Volume>(volume: &V, report: &mut Report) -> Result<Vec<FsEntry>> {
    walk_with(volume, report, |_, _| {})
}

/// Insert like `Vec::insert`, but append when `index` is past the end.
fn insert_clamped(lines: &mut Vec<String>, index: usize, line: String) {
    lines.insert(index.min(lines.len()), line);
}

/// Build the `fs_config` lines. Every line has the form
/// `<path> <uid> <gid> <mode>[ capabilities=<hex>] <symlink target>`, where
/// the target is empty for anything but symlinks. The synthesized entries for
/// the partition root are inserted in front afterwards: `/`, then either the
/// vendor partition line with gid 2000 or `/lost+found`, and finally the
/// partition line with gid 0 at index 2 for `system` or index 1 otherwise.
pub fn fs_config_lines(partition: &str, entries: &[FsEntry]) -> Vec<String> {
    let mut lines = entries
        .iter()
        .map(|entry| {
            let capabilities = entry
                .capabilities
                .map(|c| format!(" capabilities={c:#x}"))
                .unwrap_or_default();

            format!(
                "{} {} {} {}{capabilities} {}",
                entry.partition_path(partition).replace(' ', "_"),
                entry.uid,
                entry.gid,
                entry.mode,
                entry.symlink_target.as_deref().unwrap_or_default(),
            )
        })
        .collect::<Vec<_>>();

    let is_vendor = partition == "vendor";

    if is_vendor {
        insert_clamped(&mut lines, 0, format!("/ 0 {VENDOR_GID} 0755"));
        insert_clamped(&mut lines, 1, format!("{partition} 0 {VENDOR_GID} 0755"));
    } else {
        insert_clamped(&mut lines, 0, "/ 0 0 0755".to_owned());
        insert_clamped(&mut lines, 1, "/lost+found 0 0 0700".to_owned());
    }

    let index = if partition == "system" { 2 } else { 1 };
    insert_clamped(&mut lines, index, format!("{partition} 0 0 0755"));

    lines
}

/// Build the `file_contexts` lines. The entries are sorted, then scanned in
/// order for the first line that looks like `/system/system/build.prop` and
/// the first line that looks like a `lost+found` entry. Each one inserts
/// synthesized entries near the front using its context. Inserting shifts the
/// lines that are still to be scanned, so a line may be looked at twice or
/// skipped, exactly as the scan position dictates.
pub fn context_lines(partition: &str, entries: &[FsEntry]) -> Vec<String> {
    let mut lines = entries
        .iter()
        .filter_map(|e| {
            e.selinux_context.as_ref().map(|c| {
                format!("/{} {c}", escape_context_path(&e.partition_path(partition)))
            })
        })
        .collect::<Vec<_>>();
    lines.sort();

    let build_prop = Regex::new("/system/system/build..prop ").unwrap();
    let lost_found = Regex::new("lost..found").unwrap();

    let mut found_build_prop = false;
    let mut found_lost_found = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].clone();
        let context = line.split_whitespace().nth(1).unwrap_or_default();

        if !found_build_prop && build_prop.is_match(&line) {
            insert_clamped(&mut lines, 3, "/lost+\\found u:object_r:rootfs:s0".to_owned());
            insert_clamped(&mut lines, 4, format!("/{partition}/{partition}/(/.*)? {context}"));
            found_build_prop = true;
        }

        if !found_lost_found && lost_found.is_match(&line) {
            insert_clamped(&mut lines, 0, format!("/ {context}"));
            insert_clamped(&mut lines, 1, format!("/{partition}(/.*)? {context}"));
            insert_clamped(&mut lines, 2, format!("/{partition} {context}"));
            insert_clamped(&mut lines, 3, format!("/{partition}/lost+\\found {context}"));
            found_lost_found = true;
        }

        if found_build_prop && found_lost_found {
            break;
        }

        i += 1;
    }

    lines
}

/// Paths containing spaces, which are replaced with `_` everywhere else.
pub fn space_lines(partition: &str, entries: &[FsEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.partition_path(partition))
        .filter(|p| p.contains(' '))
        .collect()
}

#[cfg(unix)]
fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(unix)]
fn apply_ownership(path: &Path, entry: &FsEntry) -> std::result::Result<(), BoxError> {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt};

    let mode = u32::from_str_radix(&entry.mode, 8)?;

    // chown() clears the setuid and setgid bits, so it must come first.
    std::os::unix::fs::chown(path, Some(entry.uid), Some(entry.gid))?;
    fs::set_permissions(path, Permissions::from_mode(mode))?;

    Ok(())
}

#[cfg(not(unix))]
fn apply_ownership(_path: &Path, _entry: &FsEntry) -> std::result::Result<(), BoxError> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(path: &Path, target: &str) -> io::Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
    }

    std::os::unix::fs::symlink(target, path)
}

/// Hosts without native symlinks get a Cygwin-style marker file: the magic
/// followed by the UTF-16LE target with a BOM and a NUL terminator.
#[cfg(not(unix))]
fn write_symlink(path: &Path, target: &str) -> io::Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
    }

    fs::write(path, symlink_marker(target))
}

#[cfg_attr(unix, allow(dead_code))]
fn symlink_marker(target: &str) -> Vec<u8> {
    let mut data = SYMLINK_MARKER.to_vec();
    data.extend([0xff, 0xfe]);
    data.extend(target.encode_utf16().flat_map(u16::to_le_bytes));
    data.extend([0, 0]);
    data
}

fn write_file<V: Volume>(volume: &V, node: u64, path: &Path) -> std::result::Result<(), BoxError> {
    let mut reader = volume.open(node)?;
    let mut writer = BufWriter::new(File::create(path)?);

    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;

    Ok(())
}

/// Recreates directories, files, and symlinks under an output directory, one
/// entry at a time. Modes and ownership are applied only when running as root.
pub struct Materializer<'a> {
    out_dir: &'a Path,
    preserve: bool,
}

impl<'a> Materializer<'a> {
    /// Create `out_dir` if needed.
    pub fn new(out_dir: &'a Path, config: &ExtractConfig) -> Result<Self> {
        fs::create_dir_all(out_dir).map_err(|e| Error::File(out_dir.to_owned(), e))?;

        let preserve = config.preserve_ownership && is_root();
        if config.preserve_ownership && !preserve {
            debug!("Not running as root; ownership will not be preserved");
        }

        Ok(Self { out_dir, preserve })
    }

    /// Write a single entry. Failures are recorded in `report`.
    pub fn write_entry<V: Volume>(&self, volume: &V, entry: &FsEntry, report: &mut Report) {
        let path = entry.host_path(self.out_dir);

        let result = match entry.kind {
            EntryKind::Dir => fs::create_dir_all(&path).map_err(BoxError::from),
            EntryKind::File => write_file(volume, entry.node, &path),
            EntryKind::Symlink => {
                let target = entry.symlink_target.as_deref().unwrap_or_default();
                write_symlink(&path, target).map_err(BoxError::from)
            }
            EntryKind::Other => {
                report.push(Warning::UnmaterializedEntry { path });
                return;
            }
        };

        let result = result.and_then(|()| {
            if self.preserve && entry.kind != EntryKind::Symlink {
                apply_ownership(&path, entry)
            } else {
                Ok(())
            }
        });

        if let Err(e) = result {
            report.push(Warning::ExtractionEntryFailure {
                path: entry.path.clone(),
                reason: e.to_string(),
            });
        }
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::File(path.to_owned(), e))?;
    let mut writer = BufWriter::new(file);

    for line in lines {
        writeln!(writer, "{line}").map_err(|e| Error::File(path.to_owned(), e))?;
    }

    writer.flush().map_err(|e| Error::File(path.to_owned(), e))
}

/// Paths of the metadata files written for a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifacts {
    pub fs_config: PathBuf,
    pub contexts: PathBuf,
    pub spaces: PathBuf,
    pub info: Option<PathBuf>,
}

impl Artifacts {
    pub fn new(config_dir: &Path, partition: &str, write_info: bool) -> Self {
        Self {
            fs_config: config_dir.join(format!("{partition}_fsconfig.txt")),
            contexts: config_dir.join(format!("{partition}_contexts.txt")),
            spaces: config_dir.join(format!("{partition}_space.txt")),
            info: write_info.then(|| config_dir.join(format!("{partition}_info.txt"))),
        }
    }
}

/// Write the metadata files for already walked entries.
pub fn write_artifacts(
    info: &VolumeInfo,
    partition: &str,
    entries: &[FsEntry],
    config_dir: &Path,
    write_info: bool,
) -> Result<Artifacts> {
    fs::create_dir_all(config_dir).map_err(|e| Error::File(config_dir.to_owned(), e))?;

    let artifacts = Artifacts::new(config_dir, partition, write_info);

    write_lines(&artifacts.fs_config, &fs_config_lines(partition, entries))?;
    write_lines(&artifacts.contexts, &context_lines(partition, entries))?;
    write_lines(&artifacts.spaces, &space_lines(partition, entries))?;

    if let Some(path) = &artifacts.info {
        let data = info.to_json().map_err(Error::Serialize)?;
        fs::write(path, data).map_err(|e| Error::File(path.clone(), e))?;
    }

    Ok(artifacts)
}

/// Result of extracting a partition.
#[derive(Debug)]
pub struct Extraction {
    pub entries: Vec<FsEntry>,
    pub artifacts: Artifacts,
    pub report: Report,
}

/// Walk `volume`, copying each entry to `out_dir` as it is reached, then write
/// the metadata files for `partition` to `config_dir`.
pub fn extract<V: Volume>(
    volume: &V,
    partition: &str,
    out_dir: &Path,
    config_dir: &Path,
    config: &ExtractConfig,
) -> Result<Extraction> {
    if !util::is_safe_component(partition) {
        return Err(Error::InvalidPartitionName(partition.to_owned()));
    }

    let mut report = Report::new();

    info!("Extracting {partition} filesystem to {out_dir:?}");
    let materializer = Materializer::new(out_dir, config)?;
    let entries = walk_with(volume, &mut report, |entry, report| {
        materializer.write_entry(volume, entry, report);
    })?;
    info!("Extracted {} entries", entries.len());

    let artifacts = write_artifacts(
        &volume.info(),
        partition,
        &entries,
        config_dir,
        config.write_info,
    )?;

    Ok(Extraction {
        entries,
        artifacts,
        report,
    })
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::BTreeMap, rc::Rc};

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, Error)]
    #[error("Node #{0} not found")]
    struct MissingNode(u64);

    struct MemNode {
        metadata: Metadata,
        children: Vec<DirEntry>,
        data: Vec<u8>,
        xattrs: Vec<Xattr>,
    }

    #[derive(Default)]
    struct MemVolume {
        nodes: BTreeMap<u64, MemNode>,
        raw: Vec<u8>,
        /// Directory that cannot be listed, and a hook run when it is tried.
        broken_dir: Option<(u64, Box<dyn Fn()>)>,
    }

    impl MemVolume {
        fn add(&mut self, parent: u64, node: u64, name: &str, mode: u16, data: &[u8]) {
            let kind = match mode & S_IFMT {
                S_IFDIR => EntryKind::Dir,
                S_IFREG => EntryKind::File,
                S_IFLNK => EntryKind::Symlink,
                _ => EntryKind::Other,
            };

            self.nodes.insert(
                node,
                MemNode {
                    metadata: Metadata {
                        uid: 0,
                        gid: 2000,
                        mode,
                        size: data.len() as u64,
                        kind,
                    },
                    children: vec![
                        DirEntry {
                            name: ".".into(),
                            node,
                            kind: Some(EntryKind::Dir),
                        },
                        DirEntry {
                            name: "..".into(),
                            node: parent,
                            kind: Some(EntryKind::Dir),
                        },
                    ],
                    data: data.to_vec(),
                    xattrs: vec![],
                },
            );

            if node != parent {
                self.nodes.get_mut(&parent).unwrap().children.push(DirEntry {
                    name: name.into(),
                    node,
                    kind: Some(kind),
                });
            }
        }

        fn set_xattr(&mut self, node: u64, name: &str, value: &[u8]) {
            self.nodes.get_mut(&node).unwrap().xattrs.push(Xattr {
                name: name.into(),
                value: value.to_vec(),
            });
        }

        fn node(&self, node: u64) -> std::result::Result<&MemNode, MissingNode> {
            self.nodes.get(&node).ok_or(MissingNode(node))
        }
    }

    impl Volume for MemVolume {
        type Error = MissingNode;
        type File<'a>
            = &'a [u8]
        where
            Self: 'a;

        fn info(&self) -> VolumeInfo {
            VolumeInfo {
                inode_count: self.nodes.len() as u32,
                block_size: 16,
                blocks_per_group: 8,
                label: "test".to_owned(),
                fs_type: "ext4".to_owned(),
                image_size: self.raw.len() as u64,
            }
        }

        fn block_size(&self) -> u64 {
            16
        }

        fn root(&self) -> u64 {
            2
        }

        fn read_dir(&self, node: u64) -> std::result::Result<Vec<DirEntry>, MissingNode> {
            if let Some((broken, hook)) = &self.broken_dir
                && *broken == node
            {
                hook();
                return Err(MissingNode(node));
            }

            Ok(self.node(node)?.children.clone())
        }

        fn metadata(&self, node: u64) -> std::result::Result<Metadata, MissingNode> {
            Ok(self.node(node)?.metadata)
        }

        fn open(&self, node: u64) -> std::result::Result<&[u8], MissingNode> {
            Ok(&self.node(node)?.data)
        }

        fn xattrs(&self, node: u64) -> std::result::Result<Vec<Xattr>, MissingNode> {
            Ok(self.node(node)?.xattrs.clone())
        }

        fn read_raw(&self, offset: u64, len: u64) -> std::result::Result<Vec<u8>, MissingNode> {
            let start = offset as usize;
            Ok(self.raw[start..start + len as usize].to_vec())
        }
    }

    fn sample_volume() -> MemVolume {
        let mut volume = MemVolume::default();
        volume.add(2, 2, "", S_IFDIR | 0o755, b"");
        volume.add(2, 11, "lost+found", S_IFDIR | 0o700, b"");
        volume.add(2, 12, "bin", S_IFDIR | 0o755, b"");
        volume.add(12, 13, "sh", S_IFREG | S_ISUID | 0o755, b"#!/bin/sh\n");
        volume.add(12, 14, "ping", S_IFREG | 0o755, b"ping");
        volume.add(2, 15, "Download (2)", S_IFDIR | 0o755, b"");
        volume.add(2, 16, "My Files", S_IFDIR | 0o1777, b"");
        volume.add(16, 17, "link", S_IFLNK | 0o777, b"/system/bin/sh");
        volume.add(2, 18, "null", S_IFCHR | 0o666, b"");

        volume.set_xattr(11, SELINUX_XATTR, b"u:object_r:system_file:s0\0");
        volume.set_xattr(13, SELINUX_XATTR, b"u:object_r:shell_exec:s0\0");
        let mut cap = vec![0u8; 20];
        cap[4..8].copy_from_slice(&1u32.to_le_bytes());
        cap[12..16].copy_from_slice(&0x20u32.to_le_bytes());
        volume.set_xattr(14, CAPABILITY_XATTR, &cap);

        volume
    }

    #[test]
    fn permission_encoding() {
        assert_eq!(encode_permissions("-rwxr-xr-x").as_deref(), Some("0755"));
        assert_eq!(encode_permissions("-rwsr-xr-x").as_deref(), Some("4755"));
        assert_eq!(encode_permissions("drwxrwxrwt").as_deref(), Some("1777"));
        assert_eq!(encode_permissions("rwSr-Sr-T").as_deref(), Some("7644"));
        assert_eq!(encode_permissions("-rwxr-x").as_deref(), None);

        assert_eq!(mode_string(S_IFDIR | 0o755), "drwxr-xr-x");
        assert_eq!(mode_string(S_IFREG | S_ISUID | 0o755), "-rwsr-xr-x");
        assert_eq!(mode_string(S_IFDIR | S_ISVTX | 0o777), "drwxrwxrwt");
        assert_eq!(mode_string(S_IFREG | S_ISGID | 0o640), "-rw-r-S---");
        assert_eq!(mode_string(S_IFLNK | 0o777), "lrwxrwxrwx");
    }

    #[test]
    fn capability_decoding() {
        let mut record = vec![0u8; 20];
        record[..4].copy_from_slice(&0x02000001u32.to_le_bytes());
        record[4..8].copy_from_slice(&1u32.to_le_bytes());
        record[12..16].copy_from_slice(&0x20u32.to_le_bytes());
        assert_eq!(decode_capability(&record), Some(0x2000000001));

        // Low permitted word wider than 16 bits drops the inheritable word.
        record[4..8].copy_from_slice(&0x800000u32.to_le_bytes());
        record[8..12].copy_from_slice(&0xffffu32.to_le_bytes());
        record[12..16].copy_from_slice(&0x10u32.to_le_bytes());
        assert_eq!(decode_capability(&record), Some(0x10800000));

        // Otherwise the inheritable word sits in the middle.
        record[4..8].copy_from_slice(&1u32.to_le_bytes());
        record[8..12].copy_from_slice(&2u32.to_le_bytes());
        record[12..16].copy_from_slice(&0x20u32.to_le_bytes());
        assert_eq!(decode_capability(&record), Some(0x2000020001));

        // Words wider than four digits are concatenated, not shifted.
        record[8..12].copy_from_slice(&0x12345u32.to_le_bytes());
        assert_eq!(decode_capability(&record), Some(0x20123450001));

        assert_eq!(decode_capability(&record[..16]), Some(0x20123450001));
        assert_eq!(decode_capability(&record[..12]), None);
        assert_eq!(decode_capability(&record[..8]), None);
    }

    #[test]
    fn context_helpers() {
        assert_eq!(
            escape_context_path("system/lost+found/a.b"),
            "system/lost\\+found/a\\.b",
        );
        assert_eq!(decode_context(b"u:object_r:rootfs:s0\0\0"), "u:object_r:rootfs:s0");
        assert_eq!(decode_context(b"\0"), "");
    }

    #[test]
    fn partition_names() {
        assert_eq!(partition_name(Path::new("out/system.img")).as_deref(), Some("system"));
        assert_eq!(
            partition_name(Path::new("vendor.unsparse.img")).as_deref(),
            Some("vendor"),
        );
        assert_eq!(partition_name(Path::new("product")).as_deref(), Some("product"));
        assert_eq!(partition_name(Path::new(".img")), None);
    }

    #[test]
    fn walk_order_and_skips() {
        let volume = sample_volume();
        let mut report = Report::new();
        let entries = walk(&volume, &mut report).unwrap();

        let paths = entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>();
        assert_eq!(
            paths,
            [
                "/lost+found",
                "/bin",
                "/bin/sh",
                "/bin/ping",
                "/My Files",
                "/My Files/link",
                "/null",
            ],
        );
        assert!(report.is_empty());

        assert_eq!(entries[2].mode, "4755");
        assert_eq!(entries[2].selinux_context.as_deref(), Some("u:object_r:shell_exec:s0"));
        assert_eq!(entries[3].capabilities, Some(0x2000000001));
        assert_eq!(entries[4].mode, "1777");
        assert_eq!(entries[5].kind, EntryKind::Symlink);
        assert_eq!(entries[5].symlink_target.as_deref(), Some("/system/bin/sh"));
        assert_eq!(entries[6].kind, EntryKind::Other);
        assert!(entries.iter().all(|e| {
            (e.kind == EntryKind::Symlink) == e.symlink_target.is_some()
        }));
    }

    #[test]
    fn walk_records_entry_failures() {
        let mut volume = sample_volume();
        volume.nodes.remove(&14);

        let mut report = Report::new();
        let entries = walk(&volume, &mut report).unwrap();

        assert!(entries.iter().all(|e| e.path != "/bin/ping"));
        assert_eq!(
            report.warnings(),
            [Warning::ExtractionEntryFailure {
                path: "/bin/ping".to_owned(),
                reason: "Node #14 not found".to_owned(),
            }],
        );
    }

    #[test]
    fn symlink_block_pointer_fallback() {
        let mut volume = MemVolume::default();
        volume.add(2, 2, "", S_IFDIR | 0o755, b"");
        // Block 130 at a block size of 16. A lone continuation byte is not
        // valid UTF-8.
        volume.add(2, 12, "vendor", S_IFLNK | 0o777, &[0x82, 0x00]);
        volume.nodes.get_mut(&12).unwrap().metadata.size = 7;
        volume.raw = vec![0u8; 2100];
        volume.raw[2080..2087].copy_from_slice(b"/vendor");

        let mut report = Report::new();
        let entries = walk(&volume, &mut report).unwrap();

        assert_eq!(entries[0].symlink_target.as_deref(), Some("/vendor"));
    }

    #[test]
    fn fs_config_output() {
        let volume = sample_volume();
        let entries = walk(&volume, &mut Report::new()).unwrap();

        let lines = fs_config_lines("system", &entries);
        assert_eq!(
            &lines[..3],
            ["/ 0 0 0755", "/lost+found 0 0 0700", "system 0 0 0755"],
        );
        // The symlink target field is always present, even when empty.
        assert!(lines.contains(&"system/bin/sh 0 2000 4755 ".to_owned()));
        let ping = "system/bin/ping 0 2000 0755 capabilities=0x2000000001 ";
        assert!(lines.iter().any(|l| l == ping));
        assert!(lines.contains(&"system/My_Files 0 2000 1777 ".to_owned()));
        assert!(lines.contains(&"system/My_Files/link 0 2000 0777 /system/bin/sh".to_owned()));
        assert!(lines.iter().all(|l| !l.contains("Download")));

        // The vendor partition line is inserted twice and lost+found is omitted.
        let lines = fs_config_lines("vendor", &[]);
        assert_eq!(
            lines,
            ["/ 0 2000 0755", "vendor 0 0 0755", "vendor 0 2000 0755"],
        );

        let lines = fs_config_lines("system", &[]);
        assert_eq!(
            lines,
            ["/ 0 0 0755", "/lost+found 0 0 0700", "system 0 0 0755"],
        );

        let lines = fs_config_lines("product", &[]);
        assert_eq!(
            lines,
            ["/ 0 0 0755", "product 0 0 0755", "/lost+found 0 0 0700"],
        );
    }

    #[test]
    fn contexts_output() {
        let volume = sample_volume();
        let entries = walk(&volume, &mut Report::new()).unwrap();

        let lines = context_lines("system", &entries);
        assert_eq!(
            lines,
            [
                "/ u:object_r:system_file:s0",
                "/system(/.*)? u:object_r:system_file:s0",
                "/system u:object_r:system_file:s0",
                "/system/lost+\\found u:object_r:system_file:s0",
                "/system/bin/sh u:object_r:shell_exec:s0",
                "/system/lost\\+found u:object_r:system_file:s0",
            ],
        );
    }

    #[test]
    fn system_as_root_contexts() {
        let mut volume = MemVolume::default();
        volume.add(2, 2, "", S_IFDIR | 0o755, b"");
        volume.add(2, 11, "lost+found", S_IFDIR | 0o700, b"");
        volume.add(2, 12, "system", S_IFDIR | 0o755, b"");
        volume.add(12, 13, "build.prop", S_IFREG | 0o600, b"");
        volume.set_xattr(11, SELINUX_XATTR, b"u:object_r:rootfs:s0\0");
        volume.set_xattr(13, SELINUX_XATTR, b"u:object_r:system_file:s0\0");

        let entries = walk(&volume, &mut Report::new()).unwrap();
        let lines = context_lines("system", &entries);

        assert_eq!(
            lines,
            [
                "/ u:object_r:rootfs:s0",
                "/system(/.*)? u:object_r:rootfs:s0",
                "/system u:object_r:rootfs:s0",
                "/lost+\\found u:object_r:rootfs:s0",
                "/system/system/(/.*)? u:object_r:system_file:s0",
                "/system/lost+\\found u:object_r:rootfs:s0",
                "/system/lost\\+found u:object_r:rootfs:s0",
                "/system/system/build\\.prop u:object_r:system_file:s0",
            ],
        );
    }

    #[test]
    fn space_output() {
        let volume = sample_volume();
        let entries = walk(&volume, &mut Report::new()).unwrap();

        assert_eq!(
            space_lines("system", &entries),
            ["system/My Files", "system/My Files/link"],
        );
    }

    #[test]
    fn info_json() {
        let info = VolumeInfo {
            inode_count: 16,
            block_size: 4096,
            blocks_per_group: 32768,
            label: "/".to_owned(),
            fs_type: "ext4".to_owned(),
            image_size: 65536,
        };

        assert_eq!(
            String::from_utf8(info.to_json().unwrap()).unwrap(),
            "{\n    \"a\": 16,\n    \"b\": 4096,\n    \"c\": 32768,\n    \"d\": \"/\",\n    \
             \"e\": \"ext4\",\n    \"s\": 65536\n}",
        );
    }

    #[test]
    fn marker_file() {
        let marker = symlink_marker("/a");
        assert_eq!(marker, b"!<symlink>\xff\xfe/\0a\0\0\0");
    }

    #[test]
    fn materialize_tree() {
        let volume = sample_volume();
        let temp_dir = tempfile::tempdir().unwrap();
        let out_dir = temp_dir.path().join("system");
        let config = ExtractConfig {
            preserve_ownership: false,
            write_info: true,
        };

        let mut report = Report::new();
        let materializer = Materializer::new(&out_dir, &config).unwrap();
        walk_with(&volume, &mut report, |entry, report| {
            materializer.write_entry(&volume, entry, report);
        })
        .unwrap();

        assert_eq!(fs::read(out_dir.join("bin/sh")).unwrap(), b"#!/bin/sh\n");
        assert!(out_dir.join("My_Files").is_dir());
        assert!(!out_dir.join("Download (2)").exists());
        assert!(!out_dir.join("null").exists());

        #[cfg(unix)]
        assert_eq!(
            fs::read_link(out_dir.join("My_Files/link")).unwrap(),
            Path::new("/system/bin/sh"),
        );

        assert_eq!(
            report.warnings(),
            [Warning::UnmaterializedEntry {
                path: out_dir.join("null"),
            }],
        );
    }

    #[test]
    fn entries_are_written_during_walk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let out_dir = temp_dir.path().join("system");
        let config_dir = temp_dir.path().join("config");

        // What exists on disk when listing "My Files" fails part way through.
        let on_disk = Rc::new(Cell::new(None));
        let mut volume = sample_volume();
        volume.broken_dir = Some((16, {
            let on_disk = on_disk.clone();
            let sh = out_dir.join("bin/sh");
            let my_files = out_dir.join("My_Files");
            Box::new(move || on_disk.set(Some((sh.is_file(), my_files.is_dir()))))
        }));

        let extraction = extract(
            &volume,
            "system",
            &out_dir,
            &config_dir,
            &ExtractConfig {
                preserve_ownership: false,
                write_info: false,
            },
        )
        .unwrap();

        assert_eq!(on_disk.get(), Some((true, true)));
        assert_matches!(
            extraction.report.warnings(),
            [
                Warning::ExtractionEntryFailure { path, .. },
                Warning::UnmaterializedEntry { .. },
            ] if path == "/My Files"
        );

        // Entries before the failure stay written, as do the artifacts.
        assert_eq!(fs::read(out_dir.join("bin/sh")).unwrap(), b"#!/bin/sh\n");
        assert!(out_dir.join("bin/ping").is_file());
        assert!(!out_dir.join("My_Files/link").exists());
        assert!(extraction.artifacts.fs_config.is_file());
    }
}
