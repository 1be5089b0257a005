//! Firmware image handling.

pub mod seal;

pub use seal::{FirmwareImage, SEAL_SIZE, Seal, SealHeader, needs_update};
