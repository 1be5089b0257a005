//! Frame codec for the keyboard upgrade protocol.
//!
//! Commands are ASCII lines, except for `sendWrite`, which carries a binary
//! payload right after its tag:
//!
//! ```text
//! +--------------------------------+---------+--------+-----------+--------+
//! | "upgrade.keyscanner.sendWrite "| address | length |  payload  | CRC-32 |
//! +--------------------------------+---------+--------+-----------+--------+
//! |           29 bytes             | u32 LE  | u32 LE | <= 256 B  | u32 LE |
//! +--------------------------------+---------+--------+-----------+--------+
//! ```
//!
//! The length field always declares [`CHUNK_SIZE`], also for a final chunk
//! that is shorter. The bootloader sizes its receive buffer by block, so the
//! declared value is kept as the device expects it.

use crate::error::{Error, Result};
use crate::image::seal::{SEAL_SIZE, Seal, SealHeader};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Transfer block size in bytes.
pub const CHUNK_SIZE: usize = 256;

/// Length of the binary `sendWrite` header (address + length).
pub const WRITE_HEADER_SIZE: usize = 8;

/// Delimiter the device appends to every value it prints.
pub const LINE_DELIMITER: &[u8] = b" \r\n";

/// Exact line the device prints when a checked command failed.
pub const ERROR_SENTINEL: &[u8] = b"false \r\n";

/// Token the device prints once it is ready to be upgraded.
pub const READY_TOKEN: &[u8] = b"true";

/// Commands understood by the keyboard's upgrade plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Arm upgrade mode.
    Start,
    /// Ask whether the device is ready to flash.
    IsReady,
    /// Select the left key scanner.
    BeginLeft,
    /// Select the right key scanner.
    BeginRight,
    /// Query the selected key scanner's bootloader info.
    GetInfo,
    /// Write one block (binary payload follows the tag).
    SendWrite,
    /// Leave the selected key scanner's bootloader.
    Finish,
    /// Disarm upgrade mode.
    End,
}

impl Command {
    /// The command name as sent on the wire, without terminator.
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "upgrade.start",
            Self::IsReady => "upgrade.isReady",
            Self::BeginLeft => "upgrade.keyscanner.beginLeft",
            Self::BeginRight => "upgrade.keyscanner.beginRight",
            Self::GetInfo => "upgrade.keyscanner.getInfo",
            Self::SendWrite => "upgrade.keyscanner.sendWrite",
            Self::Finish => "upgrade.keyscanner.finish",
            Self::End => "upgrade.end",
        }
    }

    /// The bytes that open this command on the wire.
    ///
    /// Text commands end with a newline. `sendWrite` ends with a space
    /// because its binary header follows directly.
    pub fn wire_bytes(self) -> Vec<u8> {
        let mut out = self.name().as_bytes().to_vec();
        out.push(if self == Self::SendWrite { b' ' } else { b'\n' });
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bootloader info of one key scanner, as printed by `getInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Hardware revision.
    pub hardware_version: u32,
    /// Flash address the image is written to.
    pub flash_start: u32,
    /// Version of the currently installed program.
    pub program_version: u32,
    /// CRC of the currently installed program.
    pub program_crc: u32,
}

/// One `sendWrite` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand<'a> {
    /// Destination flash address.
    pub flash_offset: u32,
    /// Declared block length.
    pub length: u32,
    /// Block payload.
    pub payload: &'a [u8],
    /// CRC-32 of the payload.
    pub crc32: u32,
}

impl<'a> WriteCommand<'a> {
    /// Create a block for `payload` at `flash_offset`, declaring a full chunk.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(flash_offset: u32, payload: &'a [u8]) -> Self {
        Self {
            flash_offset,
            length: CHUNK_SIZE as u32,
            payload,
            crc32: crc32(payload),
        }
    }

    /// Assemble the complete frame: tag, header, payload, CRC.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let tag = Command::SendWrite.wire_bytes();
        let mut frame =
            Vec::with_capacity(tag.len() + WRITE_HEADER_SIZE + self.payload.len() + 4);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&encode_write_header(self.flash_offset, self.length));
        frame.extend_from_slice(self.payload);
        frame.write_u32::<LittleEndian>(self.crc32).unwrap();
        frame
    }
}

/// Encode the `sendWrite` header: flash address, then declared length.
pub fn encode_write_header(offset: u32, length: u32) -> [u8; WRITE_HEADER_SIZE] {
    let mut header = [0u8; WRITE_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], offset);
    LittleEndian::write_u32(&mut header[4..8], length);
    header
}

/// Standard CRC-32 (IEEE 802.3, as computed by zlib).
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Remove the trailing `" \r\n"` the device appends to printed values.
pub fn strip_delimiter(line: &[u8]) -> &[u8] {
    line.strip_suffix(LINE_DELIMITER).unwrap_or(line)
}

/// Whether a response line is the device's error sentinel.
///
/// Only an exact match counts; `false\r\n` or `False \r\n` are not errors.
pub fn is_error_sentinel(line: &[u8]) -> bool {
    line == ERROR_SENTINEL
}

/// Whether an `isReady` response line reports readiness.
pub fn is_ready_line(line: &[u8]) -> bool {
    strip_delimiter(line) == READY_TOKEN
}

/// Parse the `getInfo` response line.
///
/// Expects exactly four space-separated decimal `u32` values followed by
/// the `" \r\n"` delimiter.
pub fn decode_device_info(line: &[u8]) -> Result<DeviceInfo> {
    let malformed = || Error::MalformedResponse {
        step: Command::GetInfo.name().to_string(),
        line: String::from_utf8_lossy(line).into_owned(),
    };

    let body = std::str::from_utf8(strip_delimiter(line)).map_err(|_| malformed())?;
    let values = body
        .split(' ')
        .map(|token| token.parse::<u32>().map_err(|_| malformed()))
        .collect::<Result<Vec<u32>>>()?;

    match values.as_slice() {
        &[hardware_version, flash_start, program_version, program_crc] => Ok(DeviceInfo {
            hardware_version,
            flash_start,
            program_version,
            program_crc,
        }),
        _ => Err(malformed()),
    }
}

/// Decode the 32-byte seal at the start of a firmware image.
pub fn decode_seal(bytes: &[u8]) -> Result<Seal> {
    if bytes.len() < SEAL_SIZE {
        return Err(Error::TruncatedImage {
            len: bytes.len(),
            required: SEAL_SIZE,
        });
    }

    let mut fields = [0u32; 8];
    LittleEndian::read_u32_into(&bytes[..SEAL_SIZE], &mut fields);

    Ok(Seal {
        header: SealHeader {
            device_id: fields[0],
            version: fields[1],
            size: fields[2],
            crc: fields[3],
        },
        program_start: fields[4],
        program_size: fields[5],
        program_crc: fields[6],
        program_version: fields[7],
    })
}
