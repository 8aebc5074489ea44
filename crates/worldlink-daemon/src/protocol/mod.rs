//! Wire protocol for the world simulator.
//!
//! # Wire Format
//!
//! Each message is a protobuf payload preceded by its length as a varint32:
//!
//! ```text
//! +---------------------------+------------------------+
//! | Length (varint32, 1-5 B)  | Payload (protobuf)     |
//! +---------------------------+------------------------+
//! ```
//!
//! The first exchange on a connection is the connect handshake
//! ([`handshake`]); afterwards the link sends [`messages::UCommands`] and
//! receives [`messages::UResponses`] until either side disconnects.

pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use error::{MAX_HANDSHAKE_FRAME_SIZE, ProtocolError, ProtocolResult};
pub use framing::{FrameCodec, decode_length, encode_frame, read_exact, read_frame, write_frame};
pub use handshake::{CONNECTED_RESULT, ClientHandshake, HandshakeState, perform_handshake};
pub use messages::{
    Completion, DeliveryMade, InboundBatch, InboundEvent, OutboundCommand, SeqNum,
    SimulatorError, TruckReport, UCommands, UConnect, UConnected, UResponses,
};
