//! Serial device integration
//!
//! Everything that touches the device's byte stream lives here.
//!
//! ## Key components:
//! - `connection` - Own the serial port, split inbound bytes into lines
//! - `matcher` - Write a command and wait for a matching reply line
//! - `telemetry` - Classify inbound lines
//! - `fake` - In-memory device for tests

mod connection;
pub mod fake;
mod matcher;
mod telemetry;

pub use connection::{
    LineBuffer, PortOpener, PortPair, SerialConnection, SerialHandle, SystemPortOpener,
    READ_POLL_INTERVAL,
};
pub use matcher::{ReplyMatch, ReplyMatcher, ReplyPolicy};
pub use telemetry::{classify, LineClass, TelemetryRecord, SEPARATOR_MARKER, STATUS_MARKER};

/// Events published to every observer of an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A complete inbound line, terminator stripped
    Line(String),

    /// The connection ended. `reason` is `None` when it was closed on request.
    Closed { reason: Option<String> },
}
