//! Connect handshake with the world simulator.
//!
//! # Handshake Sequence
//!
//! ```text
//! Link                                       Simulator
//!   |                                            |
//!   |  -- UConnect { worldid?, trucks } ------>  |
//!   |                                            |
//!   |  <-- UConnected { worldid, "connected!" }  |
//!   |      OR                                    |
//!   |  <-- UConnected { worldid, <reason> } ---  |
//!   |                                            |
//! ```
//!
//! The handshake runs on the raw stream before it is split into reader and
//! writer halves, so it reads exactly one frame and nothing more.

use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use worldlink_core::fleet::TruckSnapshot;

use super::error::{MAX_HANDSHAKE_FRAME_SIZE, ProtocolError, ProtocolResult};
use super::framing::{read_frame, write_frame};
use super::messages::{UConnect, UConnected};

/// Result string that signals an accepted connection.
pub const CONNECTED_RESULT: &str = "connected!";

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Connect request not yet built.
    Idle,
    /// Connect request sent, waiting for the reply.
    AwaitingReply,
    /// The simulator accepted the connection.
    Completed,
    /// The simulator rejected the connection or replied out of order.
    Failed,
}

/// Client side of the connect handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    world_id: Option<i64>,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    /// Create a new client handshake handler.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            world_id: None,
        }
    }

    /// Builds the connect request and moves to [`HandshakeState::AwaitingReply`].
    pub fn create_connect(&mut self, world_id: Option<i64>, trucks: &[TruckSnapshot]) -> UConnect {
        self.state = HandshakeState::AwaitingReply;
        UConnect::for_fleet(world_id, trucks)
    }

    /// Processes the simulator's reply and returns the assigned world id.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::HandshakeRejected`] if the result is not
    ///   [`CONNECTED_RESULT`]
    /// - [`ProtocolError::HandshakeFailed`] if no connect request was sent
    pub fn process_reply(&mut self, reply: UConnected) -> ProtocolResult<i64> {
        if self.state != HandshakeState::AwaitingReply {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                "received connect reply without a pending request",
            ));
        }
        if reply.result != CONNECTED_RESULT {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_rejected(reply.result));
        }
        self.state = HandshakeState::Completed;
        self.world_id = Some(reply.worldid);
        Ok(reply.worldid)
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns `true` once the simulator accepted the connection.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }

    /// World id assigned by the simulator, after completion.
    #[must_use]
    pub const fn world_id(&self) -> Option<i64> {
        self.world_id
    }
}

/// Runs the handshake on `stream` and returns the world id.
///
/// The reply must arrive within `timeout`.
///
/// # Errors
///
/// Returns transport, framing and decode errors from the exchange, a
/// [`ProtocolError::Timeout`] if the reply is late, or the handshake
/// rejection.
pub async fn perform_handshake<S>(
    stream: &mut S,
    world_id: Option<i64>,
    trucks: &[TruckSnapshot],
    timeout: Duration,
) -> ProtocolResult<i64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ClientHandshake::new();
    let connect = handshake.create_connect(world_id, trucks);
    write_frame(stream, &connect.encode_to_vec()).await?;

    let payload = tokio::time::timeout(timeout, read_frame(stream, MAX_HANDSHAKE_FRAME_SIZE))
        .await
        .map_err(|_| ProtocolError::timeout(timeout))??;
    let reply = UConnected::decode(payload.as_slice())?;
    handshake.process_reply(reply)
}
