//! Execution-state tracking, iopub subscription, and drop diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::channels::Channel;
use crate::session::Message;
use crate::types::{Error, Result};

/// Kernel execution state, updated strictly from iopub `status` messages.
/// `Dead` is synthesized by the manager on unexpected exit, never by the
/// kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Dead,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Idle => "idle",
            ExecutionState::Busy => "busy",
            ExecutionState::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "starting" => Some(ExecutionState::Starting),
            "idle" => Some(ExecutionState::Idle),
            "busy" => Some(ExecutionState::Busy),
            "dead" => Some(ExecutionState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed status transition: the state plus the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: ExecutionState,
    /// Parent request id the status was emitted for, when present.
    pub parent_msg_id: Option<String>,
}

impl StatusEvent {
    pub fn starting() -> Self {
        Self {
            state: ExecutionState::Starting,
            parent_msg_id: None,
        }
    }

    pub fn dead() -> Self {
        Self {
            state: ExecutionState::Dead,
            parent_msg_id: None,
        }
    }
}

/// Counters for every message the client dropped instead of delivering.
/// No message disappears silently; each drop lands in exactly one counter.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub(crate) invalid_signature: AtomicU64,
    pub(crate) duplicate_signature: AtomicU64,
    pub(crate) malformed_frames: AtomicU64,
    pub(crate) unknown_parent: AtomicU64,
    pub(crate) late_replies: AtomicU64,
    pub(crate) iopub_lagged: AtomicU64,
    pub(crate) stdin_aborted: AtomicU64,
}

impl Diagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            invalid_signature: self.invalid_signature.load(Ordering::Relaxed),
            duplicate_signature: self.duplicate_signature.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_parent: self.unknown_parent.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
            iopub_lagged: self.iopub_lagged.load(Ordering::Relaxed),
            stdin_aborted: self.stdin_aborted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_parse_error(&self, err: &Error) {
        match err {
            Error::InvalidSignature { .. } => self.count(&self.invalid_signature),
            Error::DuplicateSignature { .. } => self.count(&self.duplicate_signature),
            _ => self.count(&self.malformed_frames),
        }
    }
}

/// Point-in-time view of the drop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub invalid_signature: u64,
    pub duplicate_signature: u64,
    pub malformed_frames: u64,
    pub unknown_parent: u64,
    pub late_replies: u64,
    pub iopub_lagged: u64,
    pub stdin_aborted: u64,
}

impl DiagnosticsSnapshot {
    pub fn total_dropped(&self) -> u64 {
        self.invalid_signature
            + self.duplicate_signature
            + self.malformed_frames
            + self.unknown_parent
            + self.late_replies
    }
}

/// A bounded iopub subscription.
///
/// The receive loop never blocks on a subscriber: a slow consumer loses the
/// oldest messages past the buffer bound and the loss is counted, both here
/// and in the client diagnostics.
#[derive(Debug)]
pub struct IopubSubscriber {
    pub(crate) rx: broadcast::Receiver<Message>,
    pub(crate) dropped: u64,
    pub(crate) shared_lag: std::sync::Arc<Diagnostics>,
}

impl IopubSubscriber {
    /// Receive the next broadcast message.
    ///
    /// Messages lost to backpressure are skipped and counted; the stream
    /// continues with the oldest retained message. `ChannelClosed` is
    /// returned when the iopub loop has shut down.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.shared_lag
                        .iopub_lagged
                        .fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(dropped = n, "iopub subscriber lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::channel_closed(Channel::Iopub, "iopub loop stopped"))
                }
            }
        }
    }

    /// Messages this subscriber has lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_parse() {
        assert_eq!(ExecutionState::parse("busy"), Some(ExecutionState::Busy));
        assert_eq!(ExecutionState::parse("idle"), Some(ExecutionState::Idle));
        assert_eq!(ExecutionState::parse("bogus"), None);
        assert_eq!(ExecutionState::Busy.to_string(), "busy");
    }

    #[test]
    fn test_diagnostics_classify() {
        let diag = Diagnostics::default();
        diag.count_parse_error(&Error::invalid_signature(Channel::Shell, "x"));
        diag.count_parse_error(&Error::duplicate_signature(Channel::Shell, "y"));
        diag.count_parse_error(&Error::malformed_frame(Channel::Iopub, "z"));

        let snap = diag.snapshot();
        assert_eq!(snap.invalid_signature, 1);
        assert_eq!(snap.duplicate_signature, 1);
        assert_eq!(snap.malformed_frames, 1);
        assert_eq!(snap.total_dropped(), 3);
    }
}
