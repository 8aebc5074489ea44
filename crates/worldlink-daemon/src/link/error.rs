//! Caller-facing link errors.
//!
//! Transport and framing failures never reach callers directly. They are
//! handled by the reconnection supervisor, and callers only observe them as
//! [`LinkError::ConnectionLost`] on requests that were in flight.

use std::time::Duration;

use thiserror::Error;
use worldlink_core::fleet::ValidationError;

use crate::protocol::{ProtocolError, SeqNum};

/// Errors returned by [`super::SimulatorLink`] operations and reply handles.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link is not in the running state. Nothing was sent.
    #[error("not connected to the world simulator")]
    NotConnected,

    /// Invalid arguments. Nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The simulator refused the command.
    #[error("simulator rejected command {seq}: {message}")]
    Rejected {
        /// Sequence number of the refused command.
        seq: SeqNum,
        /// Reason given by the simulator.
        message: String,
    },

    /// No reply arrived before the deadline.
    #[error("no reply for command {seq} within {after_ms} ms (acknowledged: {acknowledged})")]
    Timeout {
        /// Sequence number of the command.
        seq: SeqNum,
        /// Configured deadline in milliseconds.
        after_ms: u64,
        /// Whether the simulator had acknowledged receipt.
        acknowledged: bool,
    },

    /// The connection failed while the request was in flight.
    #[error("connection to the world simulator was lost")]
    ConnectionLost,

    /// The link was disconnected while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request with this sequence number is already pending.
    #[error("sequence number {0} is already pending")]
    DuplicateSequence(SeqNum),

    /// The reply did not match the request kind.
    #[error("unexpected {got} reply for command {seq}")]
    UnexpectedReply {
        /// Sequence number of the command.
        seq: SeqNum,
        /// Kind of reply received.
        got: &'static str,
    },

    /// Opening the connection or the handshake failed.
    #[error("connect failed: {0}")]
    Connect(#[from] ProtocolError),
}

impl LinkError {
    /// Create a timeout error.
    #[must_use]
    pub fn timeout(seq: SeqNum, after: Duration, acknowledged: bool) -> Self {
        Self::Timeout {
            seq,
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            acknowledged,
        }
    }

    /// Returns `true` if the request failed because the connection went away.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionLost | Self::ConnectionClosed
        )
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
