//! Port abstraction for serial communication with the keyboard.
//!
//! The upgrade protocol never touches `serialport` directly. It talks to a
//! [`Port`], which keeps the protocol layer I/O-agnostic and lets tests drive
//! the session with an in-memory port.
//!
//! ```text
//! +------------------+
//! |  Upgrade Session |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   LineChannel    |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port Trait    |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use defyflash::port::Port;
//!
//! fn poke<P: Port>(port: &mut P) -> defyflash::Result<()> {
//!     port.discard_input()?;
//!     port.write_frame(b"upgrade.isReady\n")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("{} answered {:?}", port.name(), &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate of the keyboard's serial interface.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default timeout of a single read call.
///
/// Kept short: the line channel enforces the overall response deadline and
/// treats a timed-out read as "nothing yet".
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port settings. The keyboard always uses 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout of a single read call.
    pub read_timeout: Duration,
}

impl SerialConfig {
    /// Settings for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the per-read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// An enumerated serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID, for USB ports.
    pub vid: Option<u16>,
    /// USB product ID, for USB ports.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial_number: Option<String>,
}

/// Byte transport to the keyboard.
pub trait Port: Read + Write + Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Drop bytes that arrived but were not read yet.
    fn discard_input(&mut self) -> Result<()>;

    /// Release the port.
    ///
    /// Later reads and writes fail with `NotConnected`. Closing twice is a
    /// no-op.
    fn close(&mut self) -> Result<()>;

    /// Write `frame` in one piece and flush it.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_all(frame)?;
        self.flush()?;
        Ok(())
    }
}

/// Lists the serial ports present on the host.
pub trait PortEnumerator {
    /// All serial ports, USB or not.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
