//! In-memory serial device for testing and development
//!
//! [`FakeDevice`] stands in for the physical device: it records every write,
//! can answer specific commands with scripted replies, and lets tests push
//! unsolicited output or pull the plug.

use super::connection::{PortOpener, PortPair};
use crate::error::BridgeError;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a fake read blocks before reporting a timeout.
const FAKE_READ_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Default)]
struct DeviceState {
    written: Vec<Vec<u8>>,
    /// Sender into the currently open reader, if any
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    /// Command bytes -> reply chunks
    replies: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    fail_open: Option<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DeviceState>,
    fail_writes: AtomicBool,
    opens: AtomicUsize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Simulated device. Clones share the same state.
#[derive(Clone, Default)]
pub struct FakeDevice {
    shared: Arc<Shared>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`PortOpener`] that connects to this device.
    pub fn opener(&self) -> FakePortOpener {
        FakePortOpener {
            shared: self.shared.clone(),
        }
    }

    /// Answer every write of exactly `command` with `reply`.
    pub fn reply_to(&self, command: &[u8], reply: &str) {
        self.reply_in_chunks(command, &[reply]);
    }

    /// Like [`reply_to`](Self::reply_to), but the reply arrives as separate chunks.
    pub fn reply_in_chunks(&self, command: &[u8], chunks: &[&str]) {
        let chunks = chunks.iter().map(|c| c.as_bytes().to_vec()).collect();
        self.shared.state().replies.insert(command.to_vec(), chunks);
    }

    /// Push unsolicited output to the open reader. Returns false if the port isn't open.
    pub fn emit(&self, text: &str) -> bool {
        match self.shared.state().inbound.as_ref() {
            Some(tx) => tx.send(text.as_bytes().to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate unplugging: the open reader sees end-of-stream.
    pub fn disconnect(&self) {
        self.shared.state().inbound = None;
    }

    /// Make the next open fail with `reason`.
    pub fn fail_next_open(&self, reason: &str) {
        self.shared.state().fail_open = Some(reason.to_string());
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every successful write so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.state().written.clone()
    }

    /// Number of writes equal to `command`.
    pub fn count_written(&self, command: &[u8]) -> usize {
        self.shared
            .state()
            .written
            .iter()
            .filter(|w| w.as_slice() == command)
            .count()
    }

    /// How many times the port was opened successfully.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

/// [`PortOpener`] backed by a [`FakeDevice`].
#[derive(Clone)]
pub struct FakePortOpener {
    shared: Arc<Shared>,
}

impl PortOpener for FakePortOpener {
    fn open(&self, address: &str, _baud_rate: u32) -> Result<PortPair, BridgeError> {
        let mut state = self.shared.state();
        if let Some(reason) = state.fail_open.take() {
            return Err(BridgeError::open(address, reason));
        }

        let (tx, rx) = mpsc::channel();
        state.inbound = Some(tx);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        Ok(PortPair {
            reader: Box::new(FakeReader {
                rx,
                leftover: Vec::new(),
            }),
            writer: Box::new(FakeWriter {
                shared: self.shared.clone(),
            }),
        })
    }
}

struct FakeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv_timeout(FAKE_READ_TIMEOUT) {
                Ok(bytes) => self.leftover = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    shared: Arc<Shared>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }

        let mut state = self.shared.state();
        state.written.push(buf.to_vec());

        if let Some(chunks) = state.replies.get(buf).cloned() {
            if let Some(tx) = state.inbound.as_ref() {
                for chunk in chunks {
                    let _ = tx.send(chunk);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
