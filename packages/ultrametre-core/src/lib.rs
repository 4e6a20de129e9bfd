//! Ultrametre bridge core
//!
//! Connects one serial device to live web observers and an external ledger
//! watch. The [`Bridge`] owns the device channel and drives everything else:
//! inbound lines are classified and fanned out through the [`BroadcastHub`],
//! ledger notifications are turned into device commands, and reply-bearing
//! requests go through the [`ReplyMatcher`].

pub mod bridge;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod serial;
pub mod sink;

use serde::{Deserialize, Serialize};
use serde_json::json;

pub use bridge::{Bridge, BridgeConfig, BridgePhase};
pub use error::BridgeError;
pub use hub::{BroadcastHub, SubscriberId, Subscription};
pub use ledger::{AccountChange, LedgerWatch, ManualLedgerWatch, SolanaAccountWatch, WatchHandle};
pub use serial::{ReplyMatch, ReplyMatcher, ReplyPolicy, TelemetryRecord};
pub use sink::{LogSink, TelemetrySink};

/// Default serial device path
pub const DEFAULT_SERIAL_PATH: &str = "COM5";

/// Default serial speed
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Reply pattern for the distance summary; capture 1 is the value
pub const SUMMARY_PATTERN: &str = r"(?i)TOTAL_DISTANCE_TRAVELLED:\s*([-+]?\d+(?:\.\d+)?)";

/// Source tag on `sent` events raised by the ledger watch
pub const LEDGER_SOURCE: &str = "ledger";

// ============================================
// Device Commands
// ============================================

/// Single-byte commands understood by the device. Each goes out newline-terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Ask for the distance summary
    Query,
    /// Reset the device's counters
    Clear,
    /// Fire the device action
    Trigger,
}

impl DeviceCommand {
    pub fn byte(self) -> u8 {
        match self {
            Self::Query => b'D',
            Self::Clear => b'C',
            Self::Trigger => b'F',
        }
    }

    /// Wire form: the command byte followed by `\n`
    pub fn frame(self) -> [u8; 2] {
        [self.byte(), b'\n']
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "D",
            Self::Clear => "C",
            Self::Trigger => "F",
        }
    }
}

// ============================================
// Broadcast Events
// ============================================

/// Event pushed to every live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum BroadcastEvent {
    /// A status line from the device, forwarded verbatim
    Serial { text: String },
    /// The bridge started or stopped
    Status { running: bool },
    /// A command was written on behalf of an external source
    Sent { command: String, source: String },
    /// A decoded telemetry sample
    Telemetry(TelemetryRecord),
}

impl BroadcastEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serial { .. } => "serial",
            Self::Status { .. } => "status",
            Self::Sent { .. } => "sent",
            Self::Telemetry(_) => "telemetry",
        }
    }

    /// JSON body of the event.
    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Serial { text } => json!({ "text": text }),
            Self::Status { running } => json!({ "running": running }),
            Self::Sent { command, source } => json!({ "command": command, "source": source }),
            Self::Telemetry(record) => json!(record),
        }
    }
}
