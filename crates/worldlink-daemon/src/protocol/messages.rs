//! World simulator protocol messages.
//!
//! Protobuf (proto2) messages exchanged with the simulator, declared with
//! `prost` derives so no build step is needed. Field names follow the wire
//! schema; tags and labels must not change.
//!
//! The second half of this module converts between the wire envelopes and
//! the link's own vocabulary:
//!
//! - [`OutboundCommand`] is what callers enqueue; the writer turns it into a
//!   [`UCommands`] envelope.
//! - [`InboundEvent`] is what the reader routes; it is produced from a
//!   [`UResponses`] envelope by [`InboundBatch::from_responses`].

use prost::Message;
use worldlink_core::fleet::{DeliveryDrop, PackageId, TruckId, TruckSnapshot, TruckStatus, WarehouseId};

use super::error::ProtocolResult;

/// Correlation id carried by commands and events.
///
/// The simulator echoes whatever 64-bit value it receives, so the wire type
/// is kept as is.
pub type SeqNum = i64;

// ============================================================================
// Handshake
// ============================================================================

/// A truck announced in the connect handshake.
#[derive(Clone, PartialEq, Message)]
pub struct UInitTruck {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub id: i32,
    /// Starting X coordinate.
    #[prost(int32, required, tag = "2")]
    pub x: i32,
    /// Starting Y coordinate.
    #[prost(int32, required, tag = "3")]
    pub y: i32,
}

/// Connect request, the first frame on every connection.
#[derive(Clone, PartialEq, Message)]
pub struct UConnect {
    /// World to join. `None` asks the simulator to create one.
    #[prost(int64, optional, tag = "1")]
    pub worldid: Option<i64>,
    /// Trucks to place in the world.
    #[prost(message, repeated, tag = "2")]
    pub trucks: Vec<UInitTruck>,
    /// Always `false` for the fleet side of the simulator.
    #[prost(bool, required, tag = "3")]
    pub is_amazon: bool,
}

/// Connect reply.
#[derive(Clone, PartialEq, Message)]
pub struct UConnected {
    /// World assigned by the simulator.
    #[prost(int64, required, tag = "1")]
    pub worldid: i64,
    /// `"connected!"` on success, otherwise the rejection reason.
    #[prost(string, required, tag = "2")]
    pub result: String,
}

// ============================================================================
// Commands
// ============================================================================

/// Send a truck to a warehouse.
#[derive(Clone, PartialEq, Message)]
pub struct UGoPickup {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// Warehouse id.
    #[prost(int32, required, tag = "2")]
    pub whid: i32,
    /// Correlation id.
    #[prost(int64, required, tag = "3")]
    pub seqnum: i64,
}

/// One package destination within a delivery run.
#[derive(Clone, PartialEq, Message)]
pub struct UDeliveryLocation {
    /// Package id.
    #[prost(int64, required, tag = "1")]
    pub packageid: i64,
    /// Destination X coordinate.
    #[prost(int32, required, tag = "2")]
    pub x: i32,
    /// Destination Y coordinate.
    #[prost(int32, required, tag = "3")]
    pub y: i32,
}

/// Send a loaded truck out to deliver.
#[derive(Clone, PartialEq, Message)]
pub struct UGoDeliver {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// Packages to drop off, in order.
    #[prost(message, repeated, tag = "2")]
    pub packages: Vec<UDeliveryLocation>,
    /// Correlation id.
    #[prost(int64, required, tag = "3")]
    pub seqnum: i64,
}

/// Ask for a truck's current status.
#[derive(Clone, PartialEq, Message)]
pub struct UQuery {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// Correlation id.
    #[prost(int64, required, tag = "2")]
    pub seqnum: i64,
}

/// Outbound envelope. Every field is a batch, so one frame may carry many
/// commands plus acknowledgements.
#[derive(Clone, PartialEq, Message)]
pub struct UCommands {
    /// Pickup commands.
    #[prost(message, repeated, tag = "1")]
    pub pickups: Vec<UGoPickup>,
    /// Delivery commands.
    #[prost(message, repeated, tag = "2")]
    pub deliveries: Vec<UGoDeliver>,
    /// New simulation speed.
    #[prost(uint32, optional, tag = "3")]
    pub simspeed: Option<u32>,
    /// Ends the session when set.
    #[prost(bool, optional, tag = "4")]
    pub disconnect: Option<bool>,
    /// Truck status queries.
    #[prost(message, repeated, tag = "5")]
    pub queries: Vec<UQuery>,
    /// Acknowledged event sequence numbers.
    #[prost(int64, repeated, packed = "false", tag = "6")]
    pub acks: Vec<i64>,
}

// ============================================================================
// Responses
// ============================================================================

/// A truck finished a pickup trip or a delivery run.
#[derive(Clone, PartialEq, Message)]
pub struct UFinished {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// X coordinate.
    #[prost(int32, required, tag = "2")]
    pub x: i32,
    /// Y coordinate.
    #[prost(int32, required, tag = "3")]
    pub y: i32,
    /// Truck status string.
    #[prost(string, required, tag = "4")]
    pub status: String,
    /// Event sequence number, acknowledged by the client.
    #[prost(int64, required, tag = "5")]
    pub seqnum: i64,
}

/// A package was dropped off.
#[derive(Clone, PartialEq, Message)]
pub struct UDeliveryMade {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// Package id.
    #[prost(int64, required, tag = "2")]
    pub packageid: i64,
    /// Event sequence number, acknowledged by the client.
    #[prost(int64, required, tag = "3")]
    pub seqnum: i64,
}

/// Reply to a [`UQuery`].
#[derive(Clone, PartialEq, Message)]
pub struct UTruck {
    /// Truck id.
    #[prost(int32, required, tag = "1")]
    pub truckid: i32,
    /// Truck status string.
    #[prost(string, required, tag = "2")]
    pub status: String,
    /// X coordinate.
    #[prost(int32, required, tag = "3")]
    pub x: i32,
    /// Y coordinate.
    #[prost(int32, required, tag = "4")]
    pub y: i32,
    /// Event sequence number, acknowledged by the client.
    #[prost(int64, required, tag = "5")]
    pub seqnum: i64,
}

/// The simulator refused a command.
#[derive(Clone, PartialEq, Message)]
pub struct UErr {
    /// Human-readable reason.
    #[prost(string, required, tag = "1")]
    pub err: String,
    /// Sequence number of the refused command.
    #[prost(int64, required, tag = "2")]
    pub originseqnum: i64,
    /// Event sequence number, acknowledged by the client.
    #[prost(int64, required, tag = "3")]
    pub seqnum: i64,
}

/// Inbound envelope.
#[derive(Clone, PartialEq, Message)]
pub struct UResponses {
    /// Finished trips.
    #[prost(message, repeated, tag = "1")]
    pub completions: Vec<UFinished>,
    /// Dropped-off packages.
    #[prost(message, repeated, tag = "2")]
    pub delivered: Vec<UDeliveryMade>,
    /// Set once the world has shut down.
    #[prost(bool, optional, tag = "3")]
    pub finished: Option<bool>,
    /// Commands the simulator has received.
    #[prost(int64, repeated, packed = "false", tag = "4")]
    pub acks: Vec<i64>,
    /// Query replies.
    #[prost(message, repeated, tag = "5")]
    pub truckstatus: Vec<UTruck>,
    /// Refused commands.
    #[prost(message, repeated, tag = "6")]
    pub error: Vec<UErr>,
}

// ============================================================================
// Builder helpers
// ============================================================================

impl UConnect {
    /// Builds the connect request for `trucks`.
    #[must_use]
    pub fn for_fleet(world_id: Option<i64>, trucks: &[TruckSnapshot]) -> Self {
        Self {
            worldid: world_id,
            trucks: trucks
                .iter()
                .map(|t| UInitTruck {
                    id: t.truck_id,
                    x: t.x,
                    y: t.y,
                })
                .collect(),
            is_amazon: false,
        }
    }
}

impl From<DeliveryDrop> for UDeliveryLocation {
    fn from(drop: DeliveryDrop) -> Self {
        Self {
            packageid: drop.package_id,
            x: drop.x,
            y: drop.y,
        }
    }
}

// ============================================================================
// Link vocabulary
// ============================================================================

/// A command queued for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Send a truck to a warehouse.
    Pickup {
        /// Truck id.
        truck_id: TruckId,
        /// Warehouse id.
        warehouse_id: WarehouseId,
        /// Correlation id.
        seq: SeqNum,
    },
    /// Send a truck out to deliver.
    Deliver {
        /// Truck id.
        truck_id: TruckId,
        /// Correlation id.
        seq: SeqNum,
        /// Drop-offs in order.
        packages: Vec<DeliveryDrop>,
    },
    /// Ask for a truck's status.
    Query {
        /// Truck id.
        truck_id: TruckId,
        /// Correlation id.
        seq: SeqNum,
    },
    /// Change the simulation speed. No reply.
    SetSpeed {
        /// New speed.
        speed: u32,
    },
    /// End the session. No reply.
    Disconnect,
    /// Acknowledge inbound events.
    AckBatch {
        /// Event sequence numbers.
        seqs: Vec<SeqNum>,
    },
}

impl OutboundCommand {
    /// Returns the correlation id of commands that expect a reply.
    #[must_use]
    pub const fn seq(&self) -> Option<SeqNum> {
        match self {
            Self::Pickup { seq, .. } | Self::Deliver { seq, .. } | Self::Query { seq, .. } => {
                Some(*seq)
            },
            Self::SetSpeed { .. } | Self::Disconnect | Self::AckBatch { .. } => None,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Pickup { .. } => "pickup",
            Self::Deliver { .. } => "deliver",
            Self::Query { .. } => "query",
            Self::SetSpeed { .. } => "set_speed",
            Self::Disconnect => "disconnect",
            Self::AckBatch { .. } => "ack_batch",
        }
    }

    /// Adds this command to an outbound envelope.
    pub fn append_to(self, envelope: &mut UCommands) {
        match self {
            Self::Pickup {
                truck_id,
                warehouse_id,
                seq,
            } => envelope.pickups.push(UGoPickup {
                truckid: truck_id,
                whid: warehouse_id,
                seqnum: seq,
            }),
            Self::Deliver {
                truck_id,
                seq,
                packages,
            } => envelope.deliveries.push(UGoDeliver {
                truckid: truck_id,
                packages: packages.into_iter().map(Into::into).collect(),
                seqnum: seq,
            }),
            Self::Query { truck_id, seq } => envelope.queries.push(UQuery {
                truckid: truck_id,
                seqnum: seq,
            }),
            Self::SetSpeed { speed } => envelope.simspeed = Some(speed),
            Self::Disconnect => envelope.disconnect = Some(true),
            Self::AckBatch { seqs } => envelope.acks.extend(seqs),
        }
    }

    /// Wraps this command in its own envelope.
    #[must_use]
    pub fn into_envelope(self) -> UCommands {
        let mut envelope = UCommands::default();
        self.append_to(&mut envelope);
        envelope
    }
}

/// A finished trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Truck id.
    pub truck_id: TruckId,
    /// X coordinate.
    pub x: i32,
    /// Y coordinate.
    pub y: i32,
    /// Status after the trip.
    pub status: TruckStatus,
    /// Sequence number of the command that finished.
    pub seq: SeqNum,
}

/// A dropped-off package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMade {
    /// Truck id.
    pub truck_id: TruckId,
    /// Package id.
    pub package_id: PackageId,
    /// Sequence number of the delivery command.
    pub seq: SeqNum,
}

/// A truck status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruckReport {
    /// Truck id.
    pub truck_id: TruckId,
    /// X coordinate.
    pub x: i32,
    /// Y coordinate.
    pub y: i32,
    /// Reported status.
    pub status: TruckStatus,
    /// Sequence number of the query.
    pub seq: SeqNum,
}

impl TruckReport {
    /// Converts into a fleet snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TruckSnapshot {
        TruckSnapshot {
            truck_id: self.truck_id,
            x: self.x,
            y: self.y,
            status: self.status.clone(),
        }
    }
}

/// A refused command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorError {
    /// Sequence number of the refused command.
    pub origin_seq: SeqNum,
    /// Sequence number of the error event itself.
    pub seq: SeqNum,
    /// Reason given by the simulator.
    pub message: String,
}

/// One event routed by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A pickup or delivery trip finished.
    Completion(Completion),
    /// A package was dropped off.
    DeliveryMade(DeliveryMade),
    /// A query reply.
    TruckStatus(TruckReport),
    /// A command was refused.
    ProtocolError(SimulatorError),
    /// The simulator received one of our commands.
    Ack(SeqNum),
}

impl InboundEvent {
    /// Returns the sequence number to acknowledge, if this event needs one.
    #[must_use]
    pub const fn ack_seq(&self) -> Option<SeqNum> {
        match self {
            Self::Completion(Completion { seq, .. })
            | Self::DeliveryMade(DeliveryMade { seq, .. })
            | Self::TruckStatus(TruckReport { seq, .. })
            | Self::ProtocolError(SimulatorError { seq, .. }) => Some(*seq),
            Self::Ack(_) => None,
        }
    }
}

/// All events carried by one inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundBatch {
    /// Events in processing order.
    pub events: Vec<InboundEvent>,
    /// The simulator ended the world.
    pub finished: bool,
}

impl InboundBatch {
    /// Decodes a frame payload into a batch.
    ///
    /// # Errors
    ///
    /// Returns [`super::ProtocolError::Decode`] if the payload is not a valid
    /// `UResponses`.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        Ok(Self::from_responses(UResponses::decode(payload)?))
    }

    /// Flattens a response envelope.
    ///
    /// Events are ordered completions, deliveries, status reports, errors
    /// and finally acks.
    #[must_use]
    pub fn from_responses(responses: UResponses) -> Self {
        let mut events = Vec::with_capacity(
            responses.completions.len()
                + responses.delivered.len()
                + responses.truckstatus.len()
                + responses.error.len()
                + responses.acks.len(),
        );
        events.extend(responses.completions.into_iter().map(|c| {
            InboundEvent::Completion(Completion {
                truck_id: c.truckid,
                x: c.x,
                y: c.y,
                status: TruckStatus::from(c.status),
                seq: c.seqnum,
            })
        }));
        events.extend(responses.delivered.into_iter().map(|d| {
            InboundEvent::DeliveryMade(DeliveryMade {
                truck_id: d.truckid,
                package_id: d.packageid,
                seq: d.seqnum,
            })
        }));
        events.extend(responses.truckstatus.into_iter().map(|t| {
            InboundEvent::TruckStatus(TruckReport {
                truck_id: t.truckid,
                x: t.x,
                y: t.y,
                status: TruckStatus::from(t.status),
                seq: t.seqnum,
            })
        }));
        events.extend(responses.error.into_iter().map(|e| {
            InboundEvent::ProtocolError(SimulatorError {
                origin_seq: e.originseqnum,
                seq: e.seqnum,
                message: e.err,
            })
        }));
        events.extend(responses.acks.into_iter().map(InboundEvent::Ack));

        Self {
            events,
            finished: responses.finished.unwrap_or(false),
        }
    }

    /// Sequence numbers that must be acknowledged, in event order.
    #[must_use]
    pub fn ack_seqs(&self) -> Vec<SeqNum> {
        self.events.iter().filter_map(InboundEvent::ack_seq).collect()
    }
}
