//! In-memory port used by unit tests.
//!
//! Every `write` call is recorded as one entry, so tests can assert that a
//! frame went out as a single contiguous write. Responses are produced by a
//! responder closure that sees each written buffer and returns the bytes the
//! device would answer with.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::port::Port;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Shared view of what a [`MockPort`] saw, usable after the port was moved.
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Writes whose payload starts with `prefix`.
    pub(crate) fn writes_starting_with(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|w| w.starts_with(prefix))
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockPort {
    read_buf: VecDeque<u8>,
    responder: Responder,
    handle: MockHandle,
}

impl MockPort {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            read_buf: VecDeque::new(),
            responder: Box::new(responder),
            handle: MockHandle::default(),
        }
    }

    /// A port that ignores writes and replays `data` to readers.
    pub(crate) fn scripted(data: &[u8]) -> Self {
        let mut port = Self::new(|_| Vec::new());
        port.read_buf.extend(data.iter().copied());
        port
    }

    pub(crate) fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.handle.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        if self.read_buf.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.read_buf.len());
        for b in buf.iter_mut().take(n) {
            *b = self.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.handle.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        self.handle.writes.lock().unwrap().push(buf.to_vec());
        let reply = (self.responder)(buf);
        self.read_buf.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        "mock"
    }

    fn discard_input(&mut self) -> Result<()> {
        self.read_buf.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
