//! Error taxonomy for the bridge core.

use thiserror::Error;

/// Every failure the bridge reports back to its immediate caller.
///
/// The `Display` text is what HTTP callers see in the `error` field, so it is
/// kept short and human-readable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The serial device could not be opened (missing, busy, or permission denied).
    #[error("Failed to open {address}: {reason}")]
    Open { address: String, reason: String },

    /// A write to an open channel failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// Every attempt of a reply request timed out.
    #[error("No response from device")]
    NoResponse { attempts: u32 },

    /// An action needed the channel but it is not open.
    #[error("Port closed")]
    PortClosed,

    /// A reply request was made while another one was still waiting.
    #[error("Another device request is already in progress")]
    ReplyInFlight,

    /// The external ledger watch failed.
    #[error("Ledger watch error: {0}")]
    Watch(String),

    /// A lifecycle transition task panicked or was aborted.
    #[error("Bridge task failed: {0}")]
    Task(String),
}

impl BridgeError {
    pub fn open(address: &str, reason: impl std::fmt::Display) -> Self {
        Self::Open {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Attempt count carried by the error, when there is one.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::NoResponse { attempts } => Some(*attempts),
            _ => None,
        }
    }
}
