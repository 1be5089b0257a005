//! Line-oriented request/response channel over a [`Port`].
//!
//! The keyboard answers every command with text lines terminated by `\n`.
//! Bytes read past the end of a line are kept for the next call, so a
//! response that arrives in one burst is still consumed one line at a time.

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Default time to wait for a complete response line.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single response line.
const MAX_LINE_LEN: usize = 4096;

/// Request/response channel that owns the underlying port.
pub struct LineChannel<P: Port> {
    port: P,
    pending: Vec<u8>,
    response_timeout: Duration,
}

impl<P: Port> LineChannel<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            pending: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Set how long [`read_line`](Self::read_line) waits for a full line.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Change the response timeout of an existing channel.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Current response timeout.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Send bytes as one contiguous write.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes", data.len());
        self.port.write_frame(data)
    }

    /// Drop buffered and not-yet-read input.
    pub fn discard_input(&mut self) -> Result<()> {
        self.pending.clear();
        self.port.discard_input()
    }

    /// Read one response line, including its terminating `\n`.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut buf = [0u8; 256];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                trace!("RX {:?}", String::from_utf8_lossy(&line));
                return Ok(line);
            }

            if self.pending.len() > MAX_LINE_LEN {
                return Err(Error::MalformedResponse {
                    step: "read_line".into(),
                    line: String::from_utf8_lossy(&self.pending).into_owned(),
                });
            }

            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.pending.extend_from_slice(&buf[..n]),
                Ok(_) => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            if start.elapsed() >= self.response_timeout {
                return Err(Error::Timeout(format!(
                    "No response line within {} ms",
                    self.response_timeout.as_millis()
                )));
            }
        }
    }

    /// Read two lines and return the first.
    ///
    /// The device pairs every response with a second line that carries no
    /// information.
    pub fn read_response(&mut self) -> Result<Vec<u8>> {
        let first = self.read_line()?;
        self.read_line()?;
        Ok(first)
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.port.close()
    }
}
