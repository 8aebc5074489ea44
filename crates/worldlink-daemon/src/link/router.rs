//! Inbound message routing and the reader loop.
//!
//! For every event in a frame the router first applies side effects (fleet
//! cache, sink calls) and only then resolves the matching request, so a
//! caller woken by a reply already sees the effects. Sequence numbers that
//! need acknowledging are collected and queued as one batch per frame.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worldlink_core::fleet::{TruckId, TruckSnapshot, TruckStatus, WarehouseId};

use super::correlator::{Reply, ResponseCorrelator};
use super::dispatcher::CommandDispatcher;
use super::error::LinkError;
use super::sink::FleetEventSink;
use crate::protocol::{
    Completion, DeliveryMade, FrameCodec, InboundBatch, InboundEvent, OutboundCommand,
    ProtocolError, SeqNum, SimulatorError, TruckReport,
};

/// The link's own view of the fleet.
///
/// Holds the last known position of every truck, used for the handshake on
/// reconnect, and the warehouse of each truck's latest pickup.
#[derive(Debug, Default)]
pub struct FleetCache {
    trucks: Mutex<BTreeMap<TruckId, TruckSnapshot>>,
    pickup_targets: Mutex<HashMap<TruckId, WarehouseId>>,
}

impl FleetCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached fleet.
    pub fn seed(&self, trucks: &[TruckSnapshot]) {
        let mut cached = self.trucks.lock().expect("lock poisoned");
        cached.clear();
        cached.extend(trucks.iter().map(|t| (t.truck_id, t.clone())));
    }

    /// Records a truck's latest position and status.
    pub fn update(&self, truck_id: TruckId, x: i32, y: i32, status: &TruckStatus) {
        let mut cached = self.trucks.lock().expect("lock poisoned");
        let truck = cached
            .entry(truck_id)
            .or_insert_with(|| TruckSnapshot::idle(truck_id, x, y));
        truck.x = x;
        truck.y = y;
        truck.status = status.clone();
    }

    /// Cached trucks ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TruckSnapshot> {
        self.trucks
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Cached record of one truck.
    #[must_use]
    pub fn truck(&self, truck_id: TruckId) -> Option<TruckSnapshot> {
        self.trucks
            .lock()
            .expect("lock poisoned")
            .get(&truck_id)
            .cloned()
    }

    /// Remembers where a truck was last sent to pick up.
    pub fn remember_pickup(&self, truck_id: TruckId, warehouse_id: WarehouseId) {
        self.pickup_targets
            .lock()
            .expect("lock poisoned")
            .insert(truck_id, warehouse_id);
    }

    /// Takes the remembered pickup warehouse of a truck.
    pub fn take_pickup_target(&self, truck_id: TruckId) -> Option<WarehouseId> {
        self.pickup_targets
            .lock()
            .expect("lock poisoned")
            .remove(&truck_id)
    }
}

/// What routing one frame did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// Requests resolved by this frame.
    pub resolved: usize,
    /// Sequence numbers queued for acknowledgement.
    pub acked: Vec<SeqNum>,
    /// The simulator ended the world.
    pub finished: bool,
}

/// Applies inbound events and resolves pending requests.
pub struct InboundMessageRouter {
    correlator: Arc<ResponseCorrelator>,
    dispatcher: CommandDispatcher,
    sink: Arc<dyn FleetEventSink>,
    fleet: Arc<FleetCache>,
}

impl std::fmt::Debug for InboundMessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessageRouter")
            .field("pending", &self.correlator.len())
            .finish_non_exhaustive()
    }
}

impl InboundMessageRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(
        correlator: Arc<ResponseCorrelator>,
        dispatcher: CommandDispatcher,
        sink: Arc<dyn FleetEventSink>,
        fleet: Arc<FleetCache>,
    ) -> Self {
        Self {
            correlator,
            dispatcher,
            sink,
            fleet,
        }
    }

    /// Routes every event of one frame, then queues its acks.
    pub fn route(&self, batch: InboundBatch) -> RouteSummary {
        let acked = batch.ack_seqs();
        let mut resolved = 0;

        for event in batch.events {
            let done = match event {
                InboundEvent::Completion(completion) => self.on_completion(completion),
                InboundEvent::DeliveryMade(delivery) => self.on_delivery(delivery),
                InboundEvent::TruckStatus(report) => self.on_truck_status(report),
                InboundEvent::ProtocolError(error) => self.on_error(error),
                InboundEvent::Ack(seq) => {
                    if self.correlator.acknowledge(seq) {
                        debug!(seq, "command acknowledged");
                    }
                    false
                },
            };
            if done {
                resolved += 1;
            }
        }

        if !acked.is_empty() {
            if let Err(e) = self.dispatcher.enqueue(OutboundCommand::AckBatch {
                seqs: acked.clone(),
            }) {
                debug!(error = %e, "writer gone, acks not sent");
            }
        }

        RouteSummary {
            resolved,
            acked,
            finished: batch.finished,
        }
    }

    fn record_position(&self, truck_id: TruckId, x: i32, y: i32, status: &TruckStatus) {
        self.fleet.update(truck_id, x, y, status);
        if self.sink.lookup_truck(truck_id).is_some() {
            self.sink.persist_truck_position(truck_id, x, y, status);
        } else {
            debug!(truck_id, "event for truck unknown to the fleet backend");
        }
    }

    fn on_completion(&self, completion: Completion) -> bool {
        info!(
            truck_id = completion.truck_id,
            x = completion.x,
            y = completion.y,
            status = %completion.status,
            seq = completion.seq,
            "truck completed trip"
        );
        self.record_position(
            completion.truck_id,
            completion.x,
            completion.y,
            &completion.status,
        );
        if completion.status.is_at_warehouse() {
            self.on_warehouse_arrival(completion.truck_id);
        }
        let seq = completion.seq;
        self.correlator.complete(seq, Ok(Reply::Completed(completion)))
    }

    fn on_warehouse_arrival(&self, truck_id: TruckId) {
        let Some(warehouse_id) = self.fleet.take_pickup_target(truck_id) else {
            warn!(truck_id, "truck arrived at a warehouse with no pickup on record");
            return;
        };
        match self.sink.active_shipment_for_truck(truck_id) {
            Some(shipment_id) => {
                info!(truck_id, warehouse_id, %shipment_id, "truck arrived for pickup");
                self.sink
                    .notify_warehouse_arrival(truck_id, warehouse_id, &shipment_id);
            },
            None => debug!(truck_id, warehouse_id, "no active shipment for arrived truck"),
        }
    }

    fn on_delivery(&self, delivery: DeliveryMade) -> bool {
        info!(
            truck_id = delivery.truck_id,
            package_id = delivery.package_id,
            seq = delivery.seq,
            "package delivered"
        );
        // Package ids are shipment ids on this link.
        self.sink
            .mark_shipment_delivered(&delivery.package_id.to_string());
        let seq = delivery.seq;
        self.correlator.complete(seq, Ok(Reply::Delivered(delivery)))
    }

    fn on_truck_status(&self, report: TruckReport) -> bool {
        debug!(
            truck_id = report.truck_id,
            status = %report.status,
            x = report.x,
            y = report.y,
            "truck status"
        );
        self.record_position(report.truck_id, report.x, report.y, &report.status);
        let seq = report.seq;
        self.correlator.complete(seq, Ok(Reply::TruckStatus(report)))
    }

    fn on_error(&self, error: SimulatorError) -> bool {
        warn!(
            origin_seq = error.origin_seq,
            seq = error.seq,
            message = %error.message,
            "simulator rejected command"
        );
        self.correlator.complete(
            error.origin_seq,
            Err(LinkError::Rejected {
                seq: error.origin_seq,
                message: error.message,
            }),
        )
    }
}

/// Why the reader stopped.
#[derive(Debug)]
pub enum ReaderExit {
    /// The session was cancelled.
    Cancelled,
    /// The simulator ended the world.
    Finished,
    /// The transport failed.
    TransportLost(ProtocolError),
}

/// Reads frames and routes them until cancelled, finished, or the
/// transport fails.
///
/// `write_failed` lets the writer report a dead socket; the reader then
/// exits as if the read had failed.
pub async fn run_reader<R>(
    router: &InboundMessageRouter,
    mut frames: FramedRead<R, FrameCodec>,
    cancel: &CancellationToken,
    write_failed: &CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return ReaderExit::Cancelled,
            () = write_failed.cancelled() => {
                return ReaderExit::TransportLost(ProtocolError::ConnectionClosed);
            },
            frame = frames.next() => frame,
        };

        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => return ReaderExit::TransportLost(e),
            None => return ReaderExit::TransportLost(ProtocolError::ConnectionClosed),
        };
        debug!(len = payload.len(), "frame received");

        match InboundBatch::decode(&payload) {
            Ok(batch) => {
                if router.route(batch).finished {
                    info!("simulator finished the world");
                    return ReaderExit::Finished;
                }
            },
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;
    use tokio::io::duplex;
    use tokio::time::Duration;

    use super::*;
    use crate::link::correlator::RequestKind;
    use crate::link::dispatcher::DispatchQueue;
    use crate::link::sink::{InMemoryFleet, WarehouseArrival};
    use crate::protocol::messages::{UDeliveryMade, UErr, UFinished, UResponses, UTruck};
    use crate::protocol::write_frame;

    struct Fixture {
        router: InboundMessageRouter,
        correlator: Arc<ResponseCorrelator>,
        sink: Arc<InMemoryFleet>,
        fleet: Arc<FleetCache>,
        _queue: DispatchQueue,
    }

    fn fixture() -> Fixture {
        let correlator = Arc::new(ResponseCorrelator::new());
        let sink = Arc::new(InMemoryFleet::new([
            TruckSnapshot::idle(1, 0, 0),
            TruckSnapshot::idle(2, 0, 0),
        ]));
        let fleet = Arc::new(FleetCache::new());
        let (dispatcher, queue) = CommandDispatcher::channel();
        let sink_dyn: Arc<dyn FleetEventSink> = sink.clone();
        let router = InboundMessageRouter::new(
            Arc::clone(&correlator),
            dispatcher,
            sink_dyn,
            Arc::clone(&fleet),
        );
        Fixture {
            router,
            correlator,
            sink,
            fleet,
            _queue: queue,
        }
    }

    fn finished(truck_id: TruckId, status: &str, seq: SeqNum) -> UFinished {
        UFinished {
            truckid: truck_id,
            x: 3,
            y: 4,
            status: status.to_string(),
            seqnum: seq,
        }
    }

    #[tokio::test]
    async fn test_completion_applies_effects_before_resolving() {
        let fx = fixture();
        fx.fleet.remember_pickup(1, 3);
        fx.sink.assign_shipment(1, "900");
        let handle = fx
            .correlator
            .register(10, RequestKind::Pickup, Duration::from_secs(30))
            .unwrap();

        let summary = fx.router.route(InboundBatch::from_responses(UResponses {
            completions: vec![finished(1, "arrive warehouse", 10)],
            ..UResponses::default()
        }));
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.acked, vec![10]);

        let reply = handle.wait().await.unwrap();
        assert!(matches!(reply, Reply::Completed(ref c) if c.truck_id == 1));
        assert_eq!(fx.sink.truck(1).unwrap().status, TruckStatus::AtWarehouse);
        assert_eq!(fx.fleet.truck(1).unwrap().x, 3);
        assert_eq!(
            fx.sink.arrivals(),
            vec![WarehouseArrival {
                truck_id: 1,
                warehouse_id: 3,
                shipment_id: "900".to_string(),
            }]
        );
    }

    #[test]
    fn test_arrival_without_pickup_target_is_skipped() {
        let fx = fixture();
        fx.sink.assign_shipment(2, "901");
        fx.router.route(InboundBatch::from_responses(UResponses {
            completions: vec![finished(2, "arrive warehouse", 11)],
            ..UResponses::default()
        }));
        assert!(fx.sink.arrivals().is_empty());
    }

    #[test]
    fn test_delivery_marks_shipment() {
        let fx = fixture();
        fx.router.route(InboundBatch::from_responses(UResponses {
            delivered: vec![UDeliveryMade {
                truckid: 2,
                packageid: 4242,
                seqnum: 20,
            }],
            ..UResponses::default()
        }));
        assert_eq!(fx.sink.delivered(), vec!["4242".to_string()]);
    }

    #[tokio::test]
    async fn test_error_fails_origin_request_and_acks_event() {
        let fx = fixture();
        let handle = fx
            .correlator
            .register(5, RequestKind::Pickup, Duration::from_secs(30))
            .unwrap();

        let summary = fx.router.route(InboundBatch::from_responses(UResponses {
            error: vec![UErr {
                err: "invalid warehouse".to_string(),
                originseqnum: 5,
                seqnum: 31,
            }],
            ..UResponses::default()
        }));
        assert_eq!(summary.acked, vec![31]);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Rejected { seq: 5, ref message } if message == "invalid warehouse"
        ));
    }

    #[test]
    fn test_ack_marks_but_does_not_resolve() {
        let fx = fixture();
        let _handle = fx
            .correlator
            .register(6, RequestKind::Query, Duration::from_secs(10))
            .unwrap();
        let summary = fx.router.route(InboundBatch::from_responses(UResponses {
            acks: vec![6],
            ..UResponses::default()
        }));
        assert_eq!(summary.resolved, 0);
        assert!(summary.acked.is_empty());
        assert!(fx.correlator.contains(6));
    }

    #[test]
    fn test_status_for_unknown_truck_updates_cache_only() {
        let fx = fixture();
        fx.router.route(InboundBatch::from_responses(UResponses {
            truckstatus: vec![UTruck {
                truckid: 99,
                status: "idle".to_string(),
                x: 7,
                y: 7,
                seqnum: 40,
            }],
            ..UResponses::default()
        }));
        assert!(fx.sink.truck(99).is_none());
        assert_eq!(fx.fleet.truck(99), Some(TruckSnapshot::idle(99, 7, 7)));
    }

    #[tokio::test]
    async fn test_reader_routes_until_peer_closes() {
        let fx = fixture();
        let (client, mut server) = duplex(64 * 1024);
        let handle = fx
            .correlator
            .register(50, RequestKind::Query, Duration::from_secs(10))
            .unwrap();

        let responses = UResponses {
            truckstatus: vec![UTruck {
                truckid: 1,
                status: "idle".to_string(),
                x: 0,
                y: 0,
                seqnum: 50,
            }],
            ..UResponses::default()
        };
        write_frame(&mut server, &responses.encode_to_vec())
            .await
            .unwrap();
        // Garbage payloads are skipped, not fatal.
        write_frame(&mut server, &[0xff, 0xff]).await.unwrap();
        drop(server);

        let exit = run_reader(
            &fx.router,
            FramedRead::new(client, FrameCodec::default()),
            &CancellationToken::new(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            exit,
            ReaderExit::TransportLost(ProtocolError::ConnectionClosed)
        ));
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_reader_stops_on_finished() {
        let fx = fixture();
        let (client, mut server) = duplex(1024);
        let responses = UResponses {
            finished: Some(true),
            ..UResponses::default()
        };
        write_frame(&mut server, &responses.encode_to_vec())
            .await
            .unwrap();

        let exit = run_reader(
            &fx.router,
            FramedRead::new(client, FrameCodec::default()),
            &CancellationToken::new(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(exit, ReaderExit::Finished));
    }

    #[tokio::test]
    async fn test_reader_exits_on_write_failure() {
        let fx = fixture();
        let (client, _server) = duplex(1024);
        let write_failed = CancellationToken::new();
        write_failed.cancel();
        let exit = run_reader(
            &fx.router,
            FramedRead::new(client, FrameCodec::default()),
            &CancellationToken::new(),
            &write_failed,
        )
        .await;
        assert!(matches!(exit, ReaderExit::TransportLost(_)));
    }
}
