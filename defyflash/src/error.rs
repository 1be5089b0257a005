//! Error types for defyflash.

use std::io;
use thiserror::Error;

/// Result type for defyflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for defyflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device answered a checked command with the `false` sentinel.
    #[error("Device rejected {step}")]
    DeviceRejected {
        /// Protocol step that was rejected.
        step: String,
    },

    /// A checked response line could not be parsed.
    #[error("Malformed response to {step}: {line:?}")]
    MalformedResponse {
        /// Protocol step whose response was malformed.
        step: String,
        /// The offending line, lossily decoded.
        line: String,
    },

    /// Firmware image is too short to hold a seal.
    #[error("Truncated image: {len} bytes, need at least {required}")]
    TruncatedImage {
        /// Actual image length.
        len: usize,
        /// Minimum required length.
        required: usize,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation cancelled by the embedding application.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Device not found on any serial port.
    #[error("Device not found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the device side of the upgrade protocol.
    ///
    /// The CLI reports these with the dedicated protocol failure exit status.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceRejected { .. } | Self::MalformedResponse { .. }
        )
    }

    /// Whether the keyboard could not be found, or its port does not exist.
    pub fn is_device_missing(&self) -> bool {
        match self {
            Self::DeviceNotFound => true,
            #[cfg(feature = "native")]
            Self::Serial(e) => e.kind() == serialport::ErrorKind::NoDevice,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_failure_classification() {
        assert!(
            Error::DeviceRejected {
                step: "beginLeft".into()
            }
            .is_protocol_failure()
        );
        assert!(
            Error::MalformedResponse {
                step: "getInfo".into(),
                line: "1 2".into()
            }
            .is_protocol_failure()
        );
        assert!(!Error::Timeout("x".into()).is_protocol_failure());
        assert!(
            !Error::TruncatedImage {
                len: 3,
                required: 32
            }
            .is_protocol_failure()
        );
    }

    #[test]
    fn test_device_missing_classification() {
        assert!(Error::DeviceNotFound.is_device_missing());
        assert!(!Error::Cancelled("ctrl-c".into()).is_device_missing());

        #[cfg(feature = "native")]
        {
            let missing = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
            assert!(Error::Serial(missing).is_device_missing());
            let busy = serialport::Error::new(serialport::ErrorKind::Unknown, "busy");
            assert!(!Error::Serial(busy).is_device_missing());
        }
    }

    #[test]
    fn test_display_messages() {
        let err = Error::DeviceRejected {
            step: "sendWrite @ 0x00000500".into(),
        };
        assert_eq!(err.to_string(), "Device rejected sendWrite @ 0x00000500");

        let err = Error::TruncatedImage {
            len: 10,
            required: 32,
        };
        assert_eq!(err.to_string(), "Truncated image: 10 bytes, need at least 32");
    }
}
