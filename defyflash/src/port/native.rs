//! Serial transport backed by the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPortInfo, SerialPortType},
    std::io::{self, Read, Write},
};

/// An open serial connection to the keyboard.
///
/// Closing drops the OS handle; the struct stays around so that the session
/// can keep owning it until it is dropped.
pub struct NativePort {
    inner: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(config.read_timeout)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
        })
    }

    /// Open `port_name` at `baud_rate` with the default read timeout.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    fn handle(&mut self) -> io::Result<&mut (dyn serialport::SerialPort + 'static)> {
        self.inner
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn discard_input(&mut self) -> Result<()> {
        self.handle()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(port: SerialPortInfo) -> Self {
        match port.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self {
                name: port.port_name,
                ..Self::default()
            },
        }
    }
}

/// Enumerates ports through `serialport::available_ports`.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}
