//! Protocol implementations.

pub mod codec;
pub mod line;

// Re-export common types
pub use codec::{Command, DeviceInfo, WriteCommand, crc32, decode_device_info, decode_seal};
pub use line::LineChannel;
