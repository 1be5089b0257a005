//! Sealed key-scanner firmware images.
//!
//! A sealed image starts with a 32-byte seal describing the program that
//! follows. The whole file, seal included, is what gets written to flash.
//!
//! ```text
//! +-----------+---------+------+-----+---------------+--------------+-------------+-----------------+
//! | device_id | version | size | crc | program_start | program_size | program_crc | program_version |
//! +-----------+---------+------+-----+---------------+--------------+-------------+-----------------+
//! |<-------------- SealHeader ------->|                                                            |
//! |<------------------------------------ 8 x u32 LE = 32 bytes ------------------------------------>|
//! ```

use crate::error::{Error, Result};
use crate::protocol::codec::{CHUNK_SIZE, DeviceInfo, crc32, decode_seal};
use log::debug;
use std::fs;
use std::path::Path;

/// Size of the seal region at the start of an image.
pub const SEAL_SIZE: usize = 32;

/// Identity part of the seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SealHeader {
    /// Target device identifier.
    pub device_id: u32,
    /// Seal format version.
    pub version: u32,
    /// Seal size.
    pub size: u32,
    /// Seal CRC.
    pub crc: u32,
}

/// Metadata embedded in the first 32 bytes of a firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Seal {
    /// Seal header.
    pub header: SealHeader,
    /// Program start address.
    pub program_start: u32,
    /// Program size in bytes.
    pub program_size: u32,
    /// Program CRC, compared against the device's installed program.
    pub program_crc: u32,
    /// Program version.
    pub program_version: u32,
}

impl Seal {
    /// Whether flashing this image would change the device's program.
    ///
    /// Returns `false` only when the installed program's CRC matches the
    /// sealed one.
    pub fn needs_update(&self, info: &DeviceInfo) -> bool {
        needs_update(self, info)
    }
}

/// Whether the image sealed with `seal` differs from what `info` reports.
pub fn needs_update(seal: &Seal, info: &DeviceInfo) -> bool {
    seal.program_crc != info.program_crc
}

/// A firmware image loaded into memory.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    seal: Seal,
}

impl FirmwareImage {
    /// Parse an image from raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let seal = decode_seal(&data)?;

        // The sealed program follows the seal and must fit in the file.
        let required = usize::try_from(seal.program_size)
            .ok()
            .and_then(|size| size.checked_add(SEAL_SIZE))
            .unwrap_or(usize::MAX);
        if data.len() < required {
            return Err(Error::TruncatedImage {
                len: data.len(),
                required,
            });
        }

        debug!(
            "Loaded image: {} bytes, program version {:#010x}, program CRC {:#010x}",
            data.len(),
            seal.program_version,
            seal.program_crc
        );
        Ok(Self { data, seal })
    }

    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref()).map_err(Error::Io)?;
        Self::from_bytes(data)
    }

    /// The decoded seal.
    pub fn seal(&self) -> &Seal {
        &self.seal
    }

    /// The full image, seal included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty. Never true for a parsed image.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of transfer blocks.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(CHUNK_SIZE)
    }

    /// Iterate over `(offset, block)` pairs in transfer order.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.data
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(i, chunk)| (i * CHUNK_SIZE, chunk))
    }

    /// CRC-32 of the whole image.
    pub fn crc32(&self) -> u32 {
        crc32(&self.data)
    }
}
