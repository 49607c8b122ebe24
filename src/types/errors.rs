//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Protocol errors carry the channel they
//! occurred on and, where known, the originating request id, so no failure
//! surfaces without saying where it came from.

use thiserror::Error;

use crate::channels::Channel;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the messaging client.
#[derive(Error, Debug)]
pub enum Error {
    /// HMAC on a received frame did not match the session key.
    #[error("invalid signature on {channel} channel: {detail}")]
    InvalidSignature { channel: Channel, detail: String },

    /// A previously-seen signature was replayed on a deduplicated channel.
    #[error("duplicate signature on {channel} channel: {signature}")]
    DuplicateSignature { channel: Channel, signature: String },

    /// Frame structure did not match the wire envelope.
    #[error("malformed frame on {channel} channel: {detail}")]
    MalformedFrame { channel: Channel, detail: String },

    /// A blocking operation exceeded its deadline.
    #[error("timeout waiting on {channel} channel{}: {detail}", fmt_msg_id(.msg_id))]
    Timeout {
        channel: Channel,
        msg_id: Option<String>,
        detail: String,
    },

    /// The ambient cancellation token fired while an operation was suspended.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Kernel launch did not reach Running.
    #[error("kernel start failed: {0}")]
    StartFailed(String),

    /// The kernel process exited while the operation was in flight.
    #[error("kernel died{}: {detail}", fmt_msg_id(.msg_id))]
    KernelDied {
        msg_id: Option<String>,
        detail: String,
    },

    /// No kernel spec by that name in the search path.
    #[error("no such kernel: {0}")]
    NoSuchKernel(String),

    /// Provisioner name not present in the registry.
    #[error("unknown provisioner: {0}")]
    UnknownProvisioner(String),

    /// Send or receive on a socket that is not open.
    #[error("{channel} channel closed: {detail}")]
    ChannelClosed { channel: Channel, detail: String },

    /// Connection file could not be created or restricted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Reply declared a protocol version outside the accepted 5.x range.
    #[error("protocol mismatch{}: got version {version}", fmt_msg_id(.msg_id))]
    ProtocolMismatch {
        msg_id: Option<String>,
        version: String,
    },

    /// Invalid configuration or descriptor contents.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_msg_id(msg_id: &Option<String>) -> String {
    match msg_id {
        Some(id) => format!(" (request {})", id),
        None => String::new(),
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_signature(channel: Channel, detail: impl Into<String>) -> Self {
        Self::InvalidSignature {
            channel,
            detail: detail.into(),
        }
    }

    pub fn duplicate_signature(channel: Channel, signature: impl Into<String>) -> Self {
        Self::DuplicateSignature {
            channel,
            signature: signature.into(),
        }
    }

    pub fn malformed_frame(channel: Channel, detail: impl Into<String>) -> Self {
        Self::MalformedFrame {
            channel,
            detail: detail.into(),
        }
    }

    pub fn timeout(channel: Channel, msg_id: Option<String>, detail: impl Into<String>) -> Self {
        Self::Timeout {
            channel,
            msg_id,
            detail: detail.into(),
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    pub fn kernel_died(msg_id: Option<String>, detail: impl Into<String>) -> Self {
        Self::KernelDied {
            msg_id,
            detail: detail.into(),
        }
    }

    pub fn channel_closed(channel: Channel, detail: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel,
            detail: detail.into(),
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    /// True when the error is a timeout, on any channel.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
