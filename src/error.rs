//! Error types surfaced by the device core.
//!
//! Connect-time failures are returned to the caller of `connect()`.
//! Send-time failures travel back through each job's completion channel.

use thiserror::Error;

/// Failure of the pairing handshake. Never retried by the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("no device advertising as '{name}' was found: {reason}")]
    DiscoveryFailed { name: String, reason: String },

    #[error("transport connect failed: {0}")]
    TransportConnectFailed(String),

    #[error("braille service not found: {0}")]
    ServiceNotFound(String),

    #[error("braille characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("could not subscribe to disconnect notifications: {0}")]
    SubscribeFailed(String),

    #[error("device worker is not running")]
    WorkerStopped,
}

/// Failure of a single `send_pattern` job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No valid link when the job was submitted or about to be written.
    #[error("device not connected")]
    NotConnected,

    /// The link died while the queue was draining.
    #[error("disconnected during operation")]
    Disconnected,

    /// A transient write error; the rest of the queue carries on.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// `disconnect()` (or a reconnect) discarded the job.
    #[error("manually disconnected")]
    ManuallyDisconnected,
}

impl SendError {
    /// True when the failure also means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::ManuallyDisconnected)
    }
}

/// Invalid raw input when building a dot pattern or wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("dot {0} is outside 1..=6")]
    OutOfRange(u8),

    #[error("dot {0} listed more than once")]
    Duplicate(u8),

    #[error("byte {0:#04x} has reserved bits 6-7 set")]
    ReservedBits(u8),
}
