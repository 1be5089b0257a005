//! # defyflash
//!
//! A library for upgrading the key-scanner firmware of split keyboards over
//! the keyboard's serial command interface.
//!
//! This crate provides:
//!
//! - The upgrade wire protocol (text commands and binary `sendWrite` frames)
//! - Sealed firmware image parsing and staleness checks
//! - A synchronous upgrade session that flashes the left and right halves
//! - Serial port discovery with known-keyboard classification
//!
//! ## Supported Keyboards
//!
//! - Dygma Raise
//! - Dygma Defy
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use defyflash::{FirmwareImage, UpgradeSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("keyscanner.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let detected = defyflash::auto_detect_port()?;
//!         let port = defyflash::NativePort::open_simple(&detected.name, 115_200)?;
//!
//!         UpgradeSession::new(port).run(&image, &mut |side, written, total| {
//!             println!("Flashing {side}: {written}/{total}");
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod upgrade;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{
        DetectedPort, DeviceKind, TransportKind, auto_detect_port, detect_keyboard_ports,
        detect_ports, format_port_list,
    },
    error::{Error, Result},
    image::seal::{FirmwareImage, SEAL_SIZE, Seal, SealHeader, needs_update},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::codec::{CHUNK_SIZE, Command, DeviceInfo, WriteCommand},
    upgrade::{
        HalfOutcome, HalfReport, Side, UpdatePolicy, UpgradeOptions, UpgradeReport,
        UpgradeSession, UpgradeState,
    },
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    // One test only: the flag is process-global
    #[test]
    fn test_interrupt_checker() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        let port = MockPort::new(|_| b"false \r\nok\r\n".to_vec());
        let handle = port.handle();
        let mut session = UpgradeSession::new(port).with_options(UpgradeOptions {
            max_ready_attempts: Some(1),
            ..UpgradeOptions::default()
        });
        session.start().unwrap();
        assert!(matches!(session.wait_ready(), Err(Error::Cancelled(_))));
        assert!(handle.writes_starting_with(b"upgrade.isReady").is_empty());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
