//! Keyboard discovery and classification.
//!
//! Serial ports are classified by USB VID/PID. Known keyboards are ranked
//! first during auto-detection; other USB serial devices are still listed so
//! that a user can pick one explicitly.

use crate::error::{Error, Result};
use crate::port::PortInfo;

#[cfg(feature = "native")]
use {
    crate::port::{NativePortEnumerator, PortEnumerator},
    log::{debug, info, trace},
};

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB CDC-ACM serial.
    Serial,
    /// Unknown or unclassified transport.
    Unknown,
}

/// Known keyboard kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Dygma Raise.
    Raise,
    /// Dygma Defy.
    Defy,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches every product of
/// the vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x1209, &[0x2201, 0x2200], DeviceKind::Raise),
    (0x35EF, &[], DeviceKind::Defy),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Raise => "Dygma Raise",
            Self::Defy => "Dygma Defy",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known keyboard.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Build a placeholder for a port name that was not enumerated.
    pub fn unlisted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Serial,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check if this endpoint is a known keyboard.
    pub fn is_keyboard(&self) -> bool {
        self.device.is_known()
    }
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        let transport = if info.vid.is_some() {
            TransportKind::Serial
        } else {
            TransportKind::Unknown
        };

        Self {
            name: info.name,
            transport,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect all available serial endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!(
                    "Found port: {} (VID: {:?}, PID: {:?}, Device: {:?})",
                    detected.name, detected.vid, detected.pid, detected.device
                );
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available serial endpoints (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect endpoints that are known keyboards.
pub fn detect_keyboard_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_keyboard)
        .collect()
}

/// Pick the best candidate out of `ports`.
///
/// Known keyboards win over any other port.
pub fn pick_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports.iter().find(|p| p.is_keyboard()) {
        return Ok(port.clone());
    }
    ports.into_iter().next().ok_or(Error::DeviceNotFound)
}

/// Auto-detect a single keyboard endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = pick_port(detect_ports())?;
    if port.is_keyboard() {
        info!("Auto-detected {}: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Auto-detect a single keyboard endpoint (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_port(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: Some("Keyboard".to_string()),
            serial_number: None,
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1209, 0x2201), DeviceKind::Raise);
        assert_eq!(DeviceKind::from_vid_pid(0x35EF, 0x0010), DeviceKind::Defy);
        assert_eq!(DeviceKind::from_vid_pid(0x35EF, 0x0012), DeviceKind::Defy);
        assert_eq!(DeviceKind::from_vid_pid(0x1209, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Unknown);
    }

    #[test]
    fn test_from_port_info_without_usb() {
        let port = DetectedPort::from(PortInfo {
            name: "/dev/ttyS0".to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        });
        assert_eq!(port.device, DeviceKind::Unknown);
        assert_eq!(port.transport, TransportKind::Unknown);
        assert!(!port.is_keyboard());
    }

    #[test]
    fn test_pick_port_prefers_keyboard() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb_port("/dev/ttyACM1", 0x35EF, 0x0010),
        ];
        assert_eq!(pick_port(ports).unwrap().name, "/dev/ttyACM1");
    }

    #[test]
    fn test_pick_port_falls_back_to_first() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            DetectedPort::unlisted("/dev/ttyS0"),
        ];
        assert_eq!(pick_port(ports).unwrap().name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_pick_port_empty() {
        assert!(matches!(pick_port(Vec::new()), Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            usb_port("/dev/ttyACM0", 0x35EF, 0x0010),
            usb_port("/dev/ttyUSB1", 0x1A86, 0x7523),
            DetectedPort::unlisted("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyACM0 [Dygma Defy] - Keyboard");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1A86 PID:7523] - Keyboard");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }

    #[test]
    fn test_detect_ports_does_not_panic() {
        let _ = detect_ports();
    }
}
