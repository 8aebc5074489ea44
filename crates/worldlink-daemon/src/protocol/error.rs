//! Protocol error types for the simulator wire layer.
//!
//! This module provides structured error types for wire-level failures,
//! enabling callers to distinguish between different failure modes.
//!
//! # Error Classification
//!
//! - **Framing errors**: malformed varint prefix, oversized frame, stream
//!   closed mid-frame
//! - **Transport errors**: socket refused, reset, broken pipe
//! - **Handshake errors**: the simulator rejected or garbled the connect
//!   exchange
//!
//! Framing and transport errors are both treated as loss of the connection;
//! see [`ProtocolError::is_transport_failure`].

use std::io;

use thiserror::Error;

/// Maximum handshake frame size in bytes (64 KiB).
///
/// The `Connected` reply carries only a world id and a short result string,
/// so anything larger is a broken or hostile peer.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Wire-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    ///
    /// Detected from the length prefix, before allocating the payload.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Actual frame size from length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame data is invalid or corrupted.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout waiting for the transport or the handshake reply.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Duration in milliseconds before timeout.
        duration_ms: u64,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The payload is not a valid protobuf message of the expected type.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The simulator answered the connect handshake with a rejection.
    #[error("simulator rejected connection: {reason}")]
    HandshakeRejected {
        /// Result string returned by the simulator.
        reason: String,
    },

    /// The handshake did not complete for a local reason.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create an invalid frame error.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a handshake failed error.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Create a handshake rejected error.
    #[must_use]
    pub fn handshake_rejected(reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error means the connection is gone.
    ///
    /// Framing errors count: once the length prefix is wrong the byte stream
    /// cannot be resynchronised.
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error indicates a framing violation.
    #[must_use]
    pub const fn is_framing_error(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::InvalidFrame { .. })
    }
}

/// Maps a short read into [`ProtocolError::ConnectionClosed`].
pub(crate) fn from_read_error(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(err)
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_frame_too_large_error() {
        let err = ProtocolError::frame_too_large(20_000_000, 1024);
        assert!(err.is_framing_error());
        assert!(err.is_transport_failure());

        let msg = err.to_string();
        assert!(msg.contains("20000000"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_handshake_errors_are_not_transport_failures() {
        assert!(!ProtocolError::handshake_rejected("world full").is_transport_failure());
        assert!(!ProtocolError::handshake_failed("bad reply").is_transport_failure());
        assert!(
            ProtocolError::handshake_rejected("world full")
                .to_string()
                .contains("world full")
        );
    }

    #[test]
    fn test_timeout_reports_millis() {
        let err = ProtocolError::timeout(Duration::from_secs(5));
        assert!(!err.is_transport_failure());
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_io_error_wrapping() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ProtocolError::from(io_err);
        assert!(err.is_transport_failure());
        assert!(!err.is_framing_error());
    }

    #[test]
    fn test_short_read_maps_to_connection_closed() {
        let err = from_read_error(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, ProtocolError::ConnectionClosed));

        let err = from_read_error(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
