//! Connection manager for the device's serial port
//!
//! Opens the port, runs a reader thread that turns the raw byte stream into
//! lines, and serializes writes against close.

use super::ChannelEvent;
use crate::error::BridgeError;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a blocking read waits before re-checking the shutdown flag.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the inbound event channel shared by all observers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Longest partial line held while waiting for its terminator.
pub const MAX_PENDING_LINE: usize = 4096;

/// The two halves of an opened port.
pub struct PortPair {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens the physical port. Swapped out for [`super::fake::FakePortOpener`] in tests.
pub trait PortOpener: Send + Sync {
    fn open(&self, address: &str, baud_rate: u32) -> Result<PortPair, BridgeError>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, address: &str, baud_rate: u32) -> Result<PortPair, BridgeError> {
        let port = serialport::new(address, baud_rate)
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(|e| BridgeError::open(address, e))?;
        let writer = port
            .try_clone()
            .map_err(|e| BridgeError::open(address, format!("failed to clone handle: {}", e)))?;

        Ok(PortPair {
            reader: Box::new(port),
            writer: Box::new(writer),
        })
    }
}

/// Accumulates raw chunks and yields complete lines.
///
/// Chunk boundaries from the port say nothing about line boundaries, so a
/// line is only released once its `\n` has arrived. Trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.pending.drain(..=pos).collect();
            while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
                raw.pop();
            }
            // Lossy so a garbled byte after a device reset doesn't kill the stream
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        if self.pending.len() > MAX_PENDING_LINE {
            log::warn!(
                "[serial] Discarding {} bytes without a line terminator",
                self.pending.len()
            );
            self.pending.clear();
        }
        lines
    }

    /// Bytes received since the last complete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

struct Shared {
    address: String,
    /// `None` once closed. Holding this lock is what serializes writes against close.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Shared {
    fn writer(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle for writing to and observing an open connection.
///
/// Once the owning [`SerialConnection`] is closed, writes through any handle
/// fail with [`BridgeError::PortClosed`].
#[derive(Clone)]
pub struct SerialHandle {
    shared: Arc<Shared>,
}

impl SerialHandle {
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn is_open(&self) -> bool {
        self.shared.writer().is_some()
    }

    /// Register a new observer of inbound lines. Dropping the receiver deregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Write `bytes` and flush.
    ///
    /// Runs on the blocking pool since the underlying port is synchronous.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let shared = self.shared.clone();
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut writer = shared.writer();
            let port = writer.as_mut().ok_or(BridgeError::PortClosed)?;
            port.write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|e| BridgeError::Write(e.to_string()))
        })
        .await
        .map_err(|e| BridgeError::Write(format!("write task failed: {}", e)))?
    }
}

/// The single open serial connection.
pub struct SerialConnection {
    handle: SerialHandle,
    baud_rate: u32,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialConnection {
    /// Open `address` at `baud_rate` and start the reader thread.
    ///
    /// Also returns the first observer of the inbound stream, registered before
    /// the reader starts so no line can slip past it.
    pub fn open(
        opener: &dyn PortOpener,
        address: &str,
        baud_rate: u32,
    ) -> Result<(Self, broadcast::Receiver<ChannelEvent>), BridgeError> {
        let PortPair { reader, writer } = opener.open(address, baud_rate)?;

        let (events, first_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader_thread = spawn_reader_thread(reader, events.clone(), shutdown.clone())
            .map_err(|e| BridgeError::open(address, format!("failed to start reader: {}", e)))?;

        log::info!("[serial] Opened {} at {} baud", address, baud_rate);

        let handle = SerialHandle {
            shared: Arc::new(Shared {
                address: address.to_string(),
                writer: Mutex::new(Some(writer)),
                events,
            }),
        };

        Ok((
            Self {
                handle,
                baud_rate,
                shutdown,
                reader: Some(reader_thread),
            },
            first_rx,
        ))
    }

    pub fn handle(&self) -> SerialHandle {
        self.handle.clone()
    }

    pub fn address(&self) -> &str {
        self.handle.address()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Close the port and wait for the reader thread to finish.
    ///
    /// Observers receive [`ChannelEvent::Closed`] with no reason.
    pub async fn close(mut self) {
        self.release();
        if let Some(reader) = self.reader.take() {
            match tokio::task::spawn_blocking(move || reader.join()).await {
                Ok(Ok(())) => {}
                _ => log::warn!("[serial] Reader thread for {} did not exit cleanly", self.address()),
            }
        }
        log::info!("[serial] Closed {}", self.address());
    }

    /// Drop the writer (waiting for any in-flight write) and signal the reader.
    fn release(&self) {
        let previous = self.handle.shared.writer().take();
        drop(previous);
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        // close() already did this; covers connections dropped without it
        if self.reader.is_some() {
            self.release();
        }
    }
}

/// Spawn the reader thread that splits the inbound byte stream into lines
/// and publishes them to every observer.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || {
            let mut lines = LineBuffer::new();
            let mut buf = [0u8; 1024];

            let reason = loop {
                if shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                match reader.read(&mut buf) {
                    Ok(0) => break Some("device disconnected".to_string()),
                    Ok(n) => {
                        for line in lines.push(&buf[..n]) {
                            // No receivers is fine; lines are best-effort
                            let _ = events.send(ChannelEvent::Line(line));
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => break Some(format!("read error: {}", e)),
                }
            };

            if let Some(ref reason) = reason {
                log::warn!("[serial] Reader stopped: {}", reason);
            }
            let _ = events.send(ChannelEvent::Closed { reason });
        })
}
