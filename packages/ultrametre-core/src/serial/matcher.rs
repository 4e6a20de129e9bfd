//! Request/reply correlation over the unframed device stream
//!
//! The device has no request ids: a reply is simply the next inbound line
//! that matches what we expect. [`ReplyMatcher::request`] writes a command,
//! watches the line stream for a match under a per-attempt deadline, and
//! retries a bounded number of times.

use super::connection::SerialHandle;
use super::ChannelEvent;
use crate::error::BridgeError;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Timing and retry budget for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// How long each attempt waits for a matching line.
    pub per_attempt_timeout: Duration,

    /// Total writes before giving up. Treated as at least 1.
    pub max_attempts: u32,

    /// Pause between a timed-out attempt and the next write.
    pub inter_attempt_delay: Duration,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_millis(1500),
            max_attempts: 3,
            inter_attempt_delay: Duration::from_millis(400),
        }
    }
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMatch {
    /// First capture group, or the whole match when the pattern has none.
    pub value: String,
    /// The full line that matched.
    pub line: String,
    /// Which attempt produced the match (1-based).
    pub attempts: u32,
}

enum AttemptOutcome {
    Matched { line: String, value: String },
    TimedOut,
    ChannelClosed,
}

/// Correlates commands with replies. Holds the single pending-reply slot.
pub struct ReplyMatcher {
    policy: ReplyPolicy,
    pending: Mutex<()>,
}

impl ReplyMatcher {
    pub fn new(policy: ReplyPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &ReplyPolicy {
        &self.policy
    }

    /// True while a request is waiting for its reply.
    pub fn is_pending(&self) -> bool {
        self.pending.try_lock().is_err()
    }

    /// Write `command` and wait for the next line matching `pattern`.
    ///
    /// Write failures inside an attempt are logged and the attempt still waits
    /// out its deadline. Fails with [`BridgeError::ReplyInFlight`] if another
    /// request holds the slot, [`BridgeError::PortClosed`] if the channel is
    /// (or becomes) closed, and [`BridgeError::NoResponse`] once every attempt
    /// has timed out.
    pub async fn request(
        &self,
        channel: &SerialHandle,
        command: &[u8],
        pattern: &Regex,
    ) -> Result<ReplyMatch, BridgeError> {
        let _slot = self
            .pending
            .try_lock()
            .map_err(|_| BridgeError::ReplyInFlight)?;

        if !channel.is_open() {
            return Err(BridgeError::PortClosed);
        }

        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            // Subscribe before writing so a fast reply can't be missed
            let mut observer = channel.subscribe();

            match channel.write(command).await {
                Ok(()) => {}
                Err(BridgeError::PortClosed) => return Err(BridgeError::PortClosed),
                Err(e) => log::warn!(
                    "[matcher] Attempt {}/{}: {} (waiting anyway)",
                    attempt,
                    max_attempts,
                    e
                ),
            }

            let outcome =
                wait_for_match(&mut observer, pattern, self.policy.per_attempt_timeout).await;
            drop(observer);

            match outcome {
                AttemptOutcome::Matched { line, value } => {
                    log::debug!("[matcher] Matched {:?} on attempt {}", line, attempt);
                    return Ok(ReplyMatch {
                        value,
                        line,
                        attempts: attempt,
                    });
                }
                AttemptOutcome::ChannelClosed => return Err(BridgeError::PortClosed),
                AttemptOutcome::TimedOut => {
                    log::debug!("[matcher] Attempt {}/{} timed out", attempt, max_attempts);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.inter_attempt_delay).await;
                    }
                }
            }
        }

        Err(BridgeError::NoResponse {
            attempts: max_attempts,
        })
    }
}

async fn wait_for_match(
    observer: &mut broadcast::Receiver<ChannelEvent>,
    pattern: &Regex,
    timeout: Duration,
) -> AttemptOutcome {
    let deadline = Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, observer.recv()).await {
            Err(_) => return AttemptOutcome::TimedOut,
            Ok(Ok(ChannelEvent::Line(line))) => {
                if let Some(caps) = pattern.captures(&line) {
                    let value = caps
                        .get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    return AttemptOutcome::Matched { line, value };
                }
            }
            Ok(Ok(ChannelEvent::Closed { .. })) | Ok(Err(broadcast::error::RecvError::Closed)) => {
                return AttemptOutcome::ChannelClosed;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                log::warn!("[matcher] Observer lagged by {} lines", n);
            }
        }
    }
}
