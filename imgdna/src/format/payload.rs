/*
 * SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Reader for update_engine payloads (`payload.bin`). Only full OTAs can be
//! reconstructed since delta operations need the source partitions.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bzip2::read::BzDecoder;
use liblzma::read::XzDecoder;
use num_traits::ToPrimitive;
use prost::Message;
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    config::PayloadConfig,
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionUpdate, Signatures,
        install_operation::Type,
    },
    report::{Mismatch, Report, Warning},
    stream::{CountingWriter, FromReader, HashingReader, ReadFixedSizeExt, WriteZerosExt},
    util,
};

const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Size of the fixed header: magic, version, manifest size, and metadata
/// signature size.
pub const PAYLOAD_HEADER_SIZE: u64 = (PAYLOAD_MAGIC.len() + 8 + 8 + 4) as u64;

/// The only major payload version that is supported.
pub const SUPPORTED_VERSION: u64 = 2;

/// Extents are always interpreted in units of this size.
pub const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload magic: {0:?}")]
    InvalidPayloadMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedPayloadVersion(u64),
    #[error("Failed to decode manifest")]
    ManifestDecodeFailure(#[source] prost::DecodeError),
    #[error("{partition}: operation #{index}: unhandled operation type: {op_type}")]
    UnhandledOperationType {
        partition: String,
        index: usize,
        op_type: String,
    },
    #[error("{partition}: operation #{index}: no destination extents")]
    MissingExtent { partition: String, index: usize },
    #[error("Invalid partition name: {0:?}")]
    InvalidPartitionName(String),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to read payload data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write partition data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
    #[error("I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw payload header. The integers are stored in big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_len: u64,
    pub metadata_signature_len: u32,
}

impl PayloadHeader {
    /// Offset of the blob section, which operation data offsets are relative
    /// to.
    pub fn data_offset(&self) -> Result<u64> {
        PAYLOAD_HEADER_SIZE
            .checked_add(self.manifest_len)
            .and_then(|o| o.checked_add(self.metadata_signature_len.into()))
            .ok_or(Error::IntegerTooLarge("data_offset"))
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader
            .read_array_exact::<4>()
            .map_err(|e| Error::DataRead("magic", e))?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::InvalidPayloadMagic(magic));
        }

        let version = reader
            .read_array_exact::<8>()
            .map(u64::from_be_bytes)
            .map_err(|e| Error::DataRead("version", e))?;
        if version != SUPPORTED_VERSION {
            return Err(Error::UnsupportedPayloadVersion(version));
        }

        let manifest_len = reader
            .read_array_exact::<8>()
            .map(u64::from_be_bytes)
            .map_err(|e| Error::DataRead("manifest_len", e))?;
        let metadata_signature_len = reader
            .read_array_exact::<4>()
            .map(u32::from_be_bytes)
            .map_err(|e| Error::DataRead("metadata_signature_len", e))?;

        Ok(Self {
            version,
            manifest_len,
            metadata_signature_len,
        })
    }
}

/// Read exactly `size` bytes without trusting `size` for the allocation.
fn read_blob(reader: impl Read, size: u64, what: &'static str) -> Result<Vec<u8>> {
    let capacity = size.to_usize().ok_or(Error::IntegerTooLarge(what))?;
    let mut buf = Vec::with_capacity(capacity.min(1024 * 1024));

    reader
        .take(size)
        .read_to_end(&mut buf)
        .map_err(|e| Error::DataRead(what, e))?;

    if buf.len() != capacity {
        return Err(Error::DataRead(
            what,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected {size} bytes, but reached EOF after {}", buf.len()),
            ),
        ));
    }

    Ok(buf)
}

/// A parsed payload: header, manifest, and metadata signatures. Operation data
/// is read on demand during reconstruction.
#[derive(Clone, Debug)]
pub struct Payload {
    pub header: PayloadHeader,
    pub manifest: DeltaArchiveManifest,
    /// Parsed for completeness, but never used for any trust decisions.
    pub metadata_signatures: Option<Signatures>,
    pub data_offset: u64,
    /// Problems found while parsing the metadata.
    pub report: Report,
}

impl<R: Read> FromReader<R> for Payload {
    type Error = Error;

    /// Parse the payload metadata. After this function returns, the reader is
    /// positioned at the beginning of the blob section.
    fn from_reader(mut reader: R) -> Result<Self> {
        let header = PayloadHeader::from_reader(&mut reader)?;
        let data_offset = header.data_offset()?;
        let mut report = Report::new();

        let manifest_raw = read_blob(&mut reader, header.manifest_len, "manifest")?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())
            .map_err(Error::ManifestDecodeFailure)?;

        let signatures_raw = read_blob(
            &mut reader,
            header.metadata_signature_len.into(),
            "metadata_signature",
        )?;
        let metadata_signatures = if signatures_raw.is_empty() {
            None
        } else {
            match Signatures::decode(signatures_raw.as_slice()) {
                Ok(s) => Some(s),
                Err(e) => {
                    report.push(Warning::InvalidMetadataSignature {
                        reason: e.to_string(),
                    });
                    None
                }
            }
        };

        if manifest.block_size() != BLOCK_SIZE {
            report.push(Warning::UnusualBlockSize {
                block_size: manifest.block_size(),
            });
        }

        debug!(
            "Payload v{}: {} partitions, data offset {data_offset}",
            header.version,
            manifest.partitions.len(),
        );

        Ok(Self {
            header,
            manifest,
            metadata_signatures,
            data_offset,
            report,
        })
    }
}

/// Whether a partition is selected by an optional `name` or `name.img` filter.
fn matches_filter(filter: Option<&str>, name: &str) -> bool {
    filter.is_none_or(|f| f == name || f.strip_suffix(".img") == Some(name))
}

/// Outcome of reconstructing a single partition image.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub name: String,
    pub path: PathBuf,
    /// Warnings on success. A failed partition's image is removed.
    pub result: Result<Report>,
}

impl Payload {
    /// Parse the payload metadata. The reader is left positioned at the
    /// beginning of the blob section.
    pub fn open(reader: impl Read) -> Result<Self> {
        Self::from_reader(reader)
    }

    /// Get the output file name, `<partition>.img`, of every partition.
    pub fn partition_names(&self) -> Vec<String> {
        self.manifest
            .partitions
            .iter()
            .map(|p| format!("{}.img", p.partition_name))
            .collect()
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
        self.manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
    }

    /// Reconstruct the partitions selected by `filter` (all partitions if
    /// [`None`]) as `<out_dir>/<partition>.img`. Each partition succeeds or
    /// fails independently.
    pub fn reconstruct(
        &self,
        mut reader: impl Read + Seek,
        filter: Option<&str>,
        out_dir: &Path,
        config: &PayloadConfig,
    ) -> Vec<PartitionOutcome> {
        let mut outcomes = vec![];

        for partition in &self.manifest.partitions {
            let name = &partition.partition_name;
            if !matches_filter(filter, name) {
                continue;
            }

            if !util::is_safe_component(name) {
                error!("Skipping partition with unsafe name: {name:?}");
                outcomes.push(PartitionOutcome {
                    name: name.clone(),
                    path: out_dir.to_owned(),
                    result: Err(Error::InvalidPartitionName(name.clone())),
                });
                continue;
            }

            let path = out_dir.join(format!("{name}.img"));

            info!("Extracting {name} to {path:?}");

            let result = self.reconstruct_partition(&mut reader, partition, &path, config);

            if let Err(e) = &result {
                error!("Failed to extract {name}: {e}");

                if let Err(e) = fs::remove_file(&path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    error!("Failed to remove incomplete image: {path:?}: {e}");
                }
            }

            outcomes.push(PartitionOutcome {
                name: name.clone(),
                path,
                result,
            });
        }

        outcomes
    }

    fn reconstruct_partition(
        &self,
        mut reader: impl Read + Seek,
        partition: &PartitionUpdate,
        path: &Path,
        config: &PayloadConfig,
    ) -> Result<Report> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::File(path.to_owned(), e))?;
        let mut report = Report::new();

        for (index, op) in partition.operations.iter().enumerate() {
            apply_operation(
                &mut reader,
                &mut file,
                self.data_offset,
                &OperationContext {
                    partition: &partition.partition_name,
                    index,
                    verify: config.verify_digests,
                },
                op,
                &mut report,
            )?;
        }

        extend_to_declared_size(&file, partition).map_err(|e| Error::File(path.to_owned(), e))?;

        file.flush()
            .map_err(|e| Error::File(path.to_owned(), e))?;

        Ok(report)
    }
}

/// Grow the image to the partition size declared in the manifest. Trailing
/// regions that no operation touches are zero.
fn extend_to_declared_size(file: &File, partition: &PartitionUpdate) -> io::Result<()> {
    let Some(size) = partition.new_partition_info.as_ref().and_then(|i| i.size) else {
        return Ok(());
    };

    if file.metadata()?.len() < size {
        file.set_len(size)?;
    }

    Ok(())
}

/// Identifies the operation being applied, for error and warning messages.
#[derive(Clone, Copy, Debug)]
pub struct OperationContext<'a> {
    pub partition: &'a str,
    pub index: usize,
    /// Check decompressed lengths and data digests.
    pub verify: bool,
}

/// Apply a single operation from the payload blob section, which starts at
/// `data_offset` in `reader`, to `writer`. Only the first destination extent is
/// used. Length and digest mismatches are recorded in `report` and do not stop
/// the operation.
pub fn apply_operation(
    mut reader: impl Read + Seek,
    mut writer: impl Write + Seek,
    data_offset: u64,
    ctx: &OperationContext,
    op: &InstallOperation,
    report: &mut Report,
) -> Result<()> {
    let op_type = Type::try_from(op.r#type).map_err(|_| Error::UnhandledOperationType {
        partition: ctx.partition.to_owned(),
        index: ctx.index,
        op_type: op.r#type.to_string(),
    })?;

    let extent = op
        .dst_extents
        .first()
        .ok_or_else(|| Error::MissingExtent {
            partition: ctx.partition.to_owned(),
            index: ctx.index,
        })?;

    if op.dst_extents.len() > 1 {
        report.push(Warning::ExtraExtentsIgnored {
            partition: ctx.partition.to_owned(),
            operation: ctx.index,
            count: op.dst_extents.len() - 1,
        });
    }

    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

    let out_offset = start_block
        .checked_mul(BLOCK_SIZE.into())
        .ok_or(Error::IntegerTooLarge("out_offset"))?;
    let out_length = num_blocks
        .checked_mul(BLOCK_SIZE.into())
        .ok_or(Error::IntegerTooLarge("out_length"))?;

    match op_type {
        Type::Zero => {
            writer
                .seek(SeekFrom::Start(out_offset))
                .map_err(|e| Error::DataWrite("seek", e))?;
            writer
                .write_zeros_exact(out_length)
                .map_err(|e| Error::DataWrite("zero", e))?;

            return Ok(());
        }
        Type::Replace | Type::ReplaceBz | Type::ReplaceXz => {}
        other => {
            return Err(Error::UnhandledOperationType {
                partition: ctx.partition.to_owned(),
                index: ctx.index,
                op_type: other.as_str_name().to_owned(),
            });
        }
    }

    // An absent offset means the start of the data blob, as with any unset
    // proto2 integer.
    let in_offset = op
        .data_offset
        .unwrap_or_default()
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("in_offset"))?;
    let data_length = op.data_length.ok_or(Error::MissingField("data_length"))?;

    reader
        .seek(SeekFrom::Start(in_offset))
        .map_err(|e| Error::DataRead("seek", e))?;
    writer
        .seek(SeekFrom::Start(out_offset))
        .map_err(|e| Error::DataWrite("seek", e))?;

    let mut hashing_reader = HashingReader::new(
        (&mut reader).take(data_length),
        Context::new(&ring::digest::SHA256),
    );
    let mut counting_writer = CountingWriter::new(&mut writer);

    let copied = match op_type {
        Type::ReplaceBz => io::copy(
            &mut BzDecoder::new(&mut hashing_reader),
            &mut counting_writer,
        ),
        Type::ReplaceXz => io::copy(
            &mut XzDecoder::new(&mut hashing_reader),
            &mut counting_writer,
        ),
        _ => io::copy(&mut hashing_reader, &mut counting_writer),
    };
    copied.map_err(|e| Error::DataWrite("operation_data", e))?;

    // Compressed streams may be followed by padding that still counts towards
    // the digest.
    io::copy(&mut hashing_reader, &mut io::sink())
        .map_err(|e| Error::DataRead("operation_data", e))?;

    let (remaining, context) = hashing_reader.finish();
    if remaining.limit() != 0 {
        return Err(Error::DataRead(
            "operation_data",
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Expected {data_length} bytes, but reached EOF with {} bytes left",
                    remaining.limit(),
                ),
            ),
        ));
    }

    let (_, written) = counting_writer.finish();

    if !ctx.verify {
        return Ok(());
    }

    if op_type != Type::Replace && written != out_length {
        report.push(Warning::DecompressionMismatch {
            partition: ctx.partition.to_owned(),
            operation: ctx.index,
            mismatch: Mismatch::Length {
                expected: out_length,
                actual: written,
            },
        });
    }

    if let Some(expected) = &op.data_sha256_hash {
        let digest = context.finish();

        if digest.as_ref() != expected.as_slice() {
            debug!(
                "Expected sha256 {}, but have {}",
                hex::encode(expected),
                hex::encode(digest),
            );

            report.push(Warning::DecompressionMismatch {
                partition: ctx.partition.to_owned(),
                operation: ctx.index,
                mismatch: Mismatch::Digest,
            });
        }
    }

    Ok(())
}

/// Parse the payload at `path` and reconstruct the selected partitions into
/// `out_dir`.
pub fn extract(
    path: &Path,
    filter: Option<&str>,
    out_dir: &Path,
    config: &PayloadConfig,
) -> Result<(Payload, Vec<PartitionOutcome>)> {
    let file = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    let mut reader = io::BufReader::new(file);
    let payload = Payload::open(&mut reader)?;

    fs::create_dir_all(out_dir).map_err(|e| Error::File(out_dir.to_owned(), e))?;

    let outcomes = payload.reconstruct(&mut reader, filter, out_dir, config);

    Ok((payload, outcomes))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn header_bytes(magic: &[u8; 4], version: u64, manifest_len: u64, sig_len: u32) -> Vec<u8> {
        let mut data = magic.to_vec();
        data.extend(version.to_be_bytes());
        data.extend(manifest_len.to_be_bytes());
        data.extend(sig_len.to_be_bytes());
        data
    }

    #[test]
    fn parse_header() {
        let data = header_bytes(PAYLOAD_MAGIC, 2, 100, 10);
        let header = PayloadHeader::from_reader(Cursor::new(data)).unwrap();

        assert_eq!(header.manifest_len, 100);
        assert_eq!(header.metadata_signature_len, 10);
        assert_eq!(header.data_offset().unwrap(), 24 + 100 + 10);
    }

    #[test]
    fn reject_bad_header() {
        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(header_bytes(b"CrAV", 2, 0, 0))),
            Err(Error::InvalidPayloadMagic(m)) if &m == b"CrAV"
        );
        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(header_bytes(PAYLOAD_MAGIC, 1, 0, 0))),
            Err(Error::UnsupportedPayloadVersion(1))
        );
        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(b"CrAU\0\0")),
            Err(Error::DataRead("version", _))
        );
    }

    #[test]
    fn filter_matching() {
        assert!(matches_filter(None, "boot"));
        assert!(matches_filter(Some("system"), "system"));
        assert!(matches_filter(Some("system.img"), "system"));
        assert!(!matches_filter(Some("system.img"), "system_ext"));
        assert!(!matches_filter(Some("boot.img"), "system"));
    }

    #[test]
    fn manifest_decode_failure() {
        let mut data = header_bytes(PAYLOAD_MAGIC, 2, 2, 0);
        data.extend([0xff, 0xff]);

        assert_matches!(
            Payload::from_reader(Cursor::new(data)),
            Err(Error::ManifestDecodeFailure(_))
        );
    }
}
