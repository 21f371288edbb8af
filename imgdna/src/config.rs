// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::sparse::{self, CrcMode};

/// Size of the region at the start of a file that is searched for the sparse
/// magic. Some vendors prepend their own headers to sparse images.
pub const DEFAULT_SCAN_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sparse.scan_limit must be at least {min} bytes: {value}")]
    ScanLimitTooSmall { value: u64, min: u64 },
    #[error("Failed to read config: {0:?}")]
    Read(String, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(String, #[source] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SparseConfig {
    /// Number of bytes at the start of the file to search for the magic.
    pub scan_limit: u64,
    /// Verify CRC32 checkpoint chunks and the header checksum.
    pub verify_crc32: bool,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            scan_limit: DEFAULT_SCAN_LIMIT,
            verify_crc32: false,
        }
    }
}

impl SparseConfig {
    pub fn crc_mode(&self) -> CrcMode {
        if self.verify_crc32 {
            CrcMode::Validate
        } else {
            CrcMode::Ignore
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayloadConfig {
    /// Check decompressed lengths and compressed blob digests.
    pub verify_digests: bool,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            verify_digests: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// Apply modes and ownership to extracted files when running as root.
    pub preserve_ownership: bool,
    /// Write the `<partition>_info.txt` summary.
    pub write_info: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            preserve_ownership: true,
            write_info: true,
        }
    }
}

/// Settings shared by all operations. Every constructor validates the values,
/// so a `Config` that exists is always usable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub sparse: SparseConfig,
    pub payload: PayloadConfig,
    pub extract: ExtractConfig,
}

impl Config {
    pub fn new(
        sparse: SparseConfig,
        payload: PayloadConfig,
        extract: ExtractConfig,
    ) -> Result<Self> {
        let config = Self {
            sparse,
            payload,
            extract,
        };
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(contents: &str, source: &str) -> Result<Self> {
        let config: Self =
            toml_edit::de::from_str(contents).map_err(|e| Error::Parse(source.to_owned(), e))?;
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = path.to_string_lossy();
        let contents =
            fs::read_to_string(path).map_err(|e| Error::Read(source.to_string(), e))?;

        Self::from_toml(&contents, &source)
    }

    fn validate(&self) -> Result<()> {
        let min = sparse::HEADER_SIZE as u64;

        if self.sparse.scan_limit < min {
            return Err(Error::ScanLimitTooSmall {
                value: self.sparse.scan_limit,
                min,
            });
        }

        Ok(())
    }
}
