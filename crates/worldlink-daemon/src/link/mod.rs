//! The simulator link.
//!
//! [`SimulatorLink`] is the handle the rest of the backend uses to talk to
//! the world simulator. It owns the connection lifecycle and exposes fleet
//! commands that return [`ReplyHandle`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Running -> ConnectionLost -> Reconnecting
//!                                  ^                              |
//!                                  +------------------------------+
//!                                        Reconnecting -> Stopped (gave up)
//! ```
//!
//! Commands are only accepted in `Running`. In every other phase they fail
//! immediately with [`LinkError::NotConnected`] and nothing is queued.
//!
//! # Components
//!
//! - [`correlator`]: pending requests and deadlines
//! - [`dispatcher`]: outbound queue and the writer loop
//! - [`router`]: inbound events and the reader loop
//! - [`sink`]: side-effect interface implemented by the business layer
//! - `session`: the tasks of one connection
//! - `supervisor`: reconnection with backoff

pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod router;
mod session;
pub mod sink;
mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worldlink_core::config::LinkConfig;
use worldlink_core::fleet::{
    DeliveryDrop, TruckId, TruckSnapshot, WarehouseId, validate_delivery, validate_pickup,
    validate_truck,
};

pub use self::correlator::{Reply, ReplyHandle, RequestKind, ResponseCorrelator, SequenceCounter};
pub use self::dispatcher::CommandDispatcher;
pub use self::error::{LinkError, LinkResult};
pub use self::router::{FleetCache, InboundMessageRouter};
pub use self::sink::{FleetEventSink, InMemoryFleet, ShipmentId, WarehouseArrival};
use self::session::Session;
use crate::health::HealthReport;
use crate::protocol::{OutboundCommand, ProtocolError, ProtocolResult, TruckReport, perform_handshake};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    /// No connection and none being attempted.
    Disconnected,
    /// An explicit connect is in progress.
    Connecting,
    /// Connected; commands are accepted.
    Running,
    /// The transport failed; the session is being drained.
    ConnectionLost,
    /// Waiting for or performing a reconnection attempt.
    Reconnecting,
    /// Reconnection gave up. A new `connect` is required.
    Stopped,
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: LinkPhase,
    /// World assigned by the simulator, kept across reconnects.
    pub world_id: Option<i64>,
    /// Logically connected.
    pub connected: bool,
    /// Both directions of the transport are open.
    pub running: bool,
    /// A reconnection loop is active.
    pub reconnecting: bool,
    /// The last connection failure, if any.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct LinkState {
    phase: LinkPhase,
    world_id: Option<i64>,
    session: Option<Session>,
    connecting: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    last_error: Option<String>,
}

impl LinkState {
    fn running_session(&self) -> LinkResult<&Session> {
        match (&self.phase, &self.session) {
            (LinkPhase::Running, Some(session)) => Ok(session),
            _ => Err(LinkError::NotConnected),
        }
    }
}

/// State shared by the link handle and its background tasks.
pub(crate) struct LinkShared {
    config: LinkConfig,
    sink: Arc<dyn FleetEventSink>,
    correlator: Arc<ResponseCorrelator>,
    fleet: Arc<FleetCache>,
    sequence: SequenceCounter,
    session_ids: AtomicU64,
    state: Mutex<LinkState>,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl LinkShared {
    /// Opens the socket, runs the handshake and installs a new session.
    ///
    /// Returns `Ok(None)` if `abort` was cancelled before the session could
    /// be installed.
    async fn establish(
        self: &Arc<Self>,
        world_id: Option<i64>,
        trucks: &[TruckSnapshot],
        abort: Option<&CancellationToken>,
    ) -> ProtocolResult<Option<i64>> {
        let simulator = &self.config.simulator;
        let address = simulator.address();
        info!(%address, world_id = ?world_id, trucks = trucks.len(), "connecting to world simulator");

        let mut stream = tokio::time::timeout(simulator.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ProtocolError::timeout(simulator.connect_timeout))??;
        stream.set_nodelay(simulator.tcp_nodelay)?;

        let assigned =
            perform_handshake(&mut stream, world_id, trucks, simulator.connect_timeout).await?;

        let mut state = self.state.lock().expect("lock poisoned");
        if abort.is_some_and(CancellationToken::is_cancelled) {
            debug!("connection established after cancellation; dropping it");
            return Ok(None);
        }
        let id = self.session_ids.fetch_add(1, Ordering::Relaxed);
        let session = Session::start(self, id, stream, assigned);
        if let Some(speed) = simulator.default_sim_speed {
            // Queued before any caller can see the session.
            if let Err(e) = session
                .dispatcher()
                .enqueue(OutboundCommand::SetSpeed { speed })
            {
                debug!(error = %e, speed, "writer gone, default speed not sent");
            }
        }
        state.session = Some(session);
        state.world_id = Some(assigned);
        state.phase = LinkPhase::Running;
        state.reconnect = None;
        state.last_error = None;
        info!(world_id = assigned, session = id, "connected to world simulator");
        Ok(Some(assigned))
    }

    /// Ends `session_id` without reconnecting. Frames already queued,
    /// such as the acks of the final batch, are still written.
    async fn end_session(&self, session_id: u64, reason: &str) {
        let session = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.session.as_ref().map(Session::id) != Some(session_id) {
                return;
            }
            info!(session = session_id, reason, "session ended");
            state.phase = LinkPhase::Disconnected;
            state.last_error = Some(reason.to_string());
            state.session.take()
        };
        self.correlator.fail_all(|| LinkError::ConnectionClosed);
        if let Some(session) = session {
            session.drain(self.config.requests.disconnect_grace).await;
        }
    }
}

/// Client link to the world simulator.
///
/// Dropping the link stops every background task.
pub struct SimulatorLink {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for SimulatorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorLink")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl SimulatorLink {
    /// Creates a disconnected link.
    #[must_use]
    pub fn new(config: LinkConfig, sink: Arc<dyn FleetEventSink>) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                config,
                sink,
                correlator: Arc::new(ResponseCorrelator::new()),
                fleet: Arc::new(FleetCache::new()),
                sequence: SequenceCounter::new(),
                session_ids: AtomicU64::new(1),
                state: Mutex::new(LinkState {
                    phase: LinkPhase::Disconnected,
                    world_id: None,
                    session: None,
                    connecting: None,
                    reconnect: None,
                    last_error: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Configuration the link was built with.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Connects and announces `trucks`. Returns the world id.
    ///
    /// Succeeds without doing anything if the link is already running. An
    /// active reconnection loop is cancelled and replaced by this attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Connect`] if the socket cannot be opened, the
    /// handshake fails, or the simulator rejects the connection.
    pub async fn connect(
        &self,
        world_id: Option<i64>,
        trucks: Vec<TruckSnapshot>,
    ) -> LinkResult<i64> {
        let _guard = self.shared.connect_lock.lock().await;
        let abort = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if let Ok(session) = state.running_session() {
                debug!(world_id = session.world_id(), "already connected");
                return Ok(session.world_id());
            }
            if let Some(token) = state.reconnect.take() {
                info!("explicit connect replaces reconnection loop");
                token.cancel();
            }
            state.phase = LinkPhase::Connecting;
            let abort = self.shared.shutdown.child_token();
            state.connecting = Some(abort.clone());
            abort
        };
        self.shared.fleet.seed(&trucks);

        let outcome = tokio::select! {
            () = abort.cancelled() => Ok(None),
            outcome = self.shared.establish(world_id, &trucks, Some(&abort)) => outcome,
        };

        // The connect lock keeps any stored token ours.
        let mut state = self.shared.state.lock().expect("lock poisoned");
        state.connecting = None;
        match outcome {
            Ok(Some(assigned)) => Ok(assigned),
            Ok(None) => {
                info!("connect abandoned by disconnect");
                Err(LinkError::ConnectionClosed)
            },
            Err(e) => {
                warn!(error = %e, "connect to world simulator failed");
                if !abort.is_cancelled() {
                    state.phase = LinkPhase::Disconnected;
                    state.last_error = Some(e.to_string());
                }
                Err(LinkError::Connect(e))
            },
        }
    }

    /// Disconnects from the simulator.
    ///
    /// Sends a disconnect command, waits briefly for it to be written, then
    /// closes the socket. Every pending request fails with
    /// [`LinkError::ConnectionClosed`]. Cancels any reconnection loop and
    /// abandons a connect whose handshake has not finished. Calling it again
    /// is harmless.
    pub async fn disconnect(&self) {
        let session = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if let Some(token) = state.reconnect.take() {
                token.cancel();
            }
            if let Some(token) = state.connecting.take() {
                token.cancel();
            }
            state.phase = LinkPhase::Disconnected;
            state.world_id = None;
            state.last_error = None;
            state.session.take()
        };
        if let Some(session) = session {
            info!(world_id = session.world_id(), "disconnecting from world simulator");
            session
                .close_gracefully(self.shared.config.requests.disconnect_grace)
                .await;
        }
        let failed = self
            .shared
            .correlator
            .fail_all(|| LinkError::ConnectionClosed);
        if failed > 0 {
            debug!(failed, "failed pending requests on disconnect");
        }
    }

    /// Returns `true` while the link is in the running phase.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().expect("lock poisoned");
        state.running_session().is_ok()
    }

    /// Returns `true` while running and the socket is open in both
    /// directions.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let state = self.shared.state.lock().expect("lock poisoned");
        state
            .running_session()
            .is_ok_and(Session::is_transport_open)
    }

    /// World id assigned by the simulator.
    #[must_use]
    pub fn world_id(&self) -> Option<i64> {
        self.shared.state.lock().expect("lock poisoned").world_id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> LinkPhase {
        self.shared.state.lock().expect("lock poisoned").phase
    }

    /// Snapshot of the connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        let state = self.shared.state.lock().expect("lock poisoned");
        let session = state.running_session().ok();
        ConnectionState {
            phase: state.phase,
            world_id: state.world_id,
            connected: session.is_some(),
            running: session.is_some_and(Session::is_transport_open),
            reconnecting: state.reconnect.is_some(),
            last_error: state.last_error.clone(),
        }
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    /// The link's last known position of every truck.
    #[must_use]
    pub fn fleet_snapshot(&self) -> Vec<TruckSnapshot> {
        self.shared.fleet.snapshot()
    }

    /// Sends a truck to a warehouse.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`LinkError::Validation`] or
    /// [`LinkError::NotConnected`]; nothing is sent in either case.
    pub fn pickup(&self, truck_id: TruckId, warehouse_id: WarehouseId) -> LinkResult<ReplyHandle> {
        validate_pickup(truck_id, warehouse_id)?;
        let timeout = self.shared.config.requests.pickup_timeout;
        let handle = self.submit(RequestKind::Pickup, timeout, |seq| {
            // Recorded before the command can reach the wire.
            self.shared.fleet.remember_pickup(truck_id, warehouse_id);
            OutboundCommand::Pickup {
                truck_id,
                warehouse_id,
                seq,
            }
        })?;
        info!(truck_id, warehouse_id, seq = handle.seq(), "truck sent to pickup");
        Ok(handle)
    }

    /// Sends a truck out to deliver `packages`.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`LinkError::Validation`] or
    /// [`LinkError::NotConnected`]; nothing is sent in either case.
    pub fn deliver(&self, truck_id: TruckId, packages: Vec<DeliveryDrop>) -> LinkResult<ReplyHandle> {
        validate_delivery(truck_id, &packages)?;
        let count = packages.len();
        let timeout = self.shared.config.requests.deliver_timeout;
        let handle = self.submit(RequestKind::Deliver, timeout, |seq| OutboundCommand::Deliver {
            truck_id,
            seq,
            packages,
        })?;
        info!(truck_id, packages = count, seq = handle.seq(), "truck sent to deliver");
        Ok(handle)
    }

    /// Queries a truck's status.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`LinkError::Validation`] or
    /// [`LinkError::NotConnected`]; nothing is sent in either case.
    pub fn query(&self, truck_id: TruckId) -> LinkResult<ReplyHandle> {
        validate_truck(truck_id)?;
        let timeout = self.shared.config.requests.query_timeout;
        let handle = self.submit(RequestKind::Query, timeout, |seq| OutboundCommand::Query {
            truck_id,
            seq,
        })?;
        debug!(truck_id, seq = handle.seq(), "truck status queried");
        Ok(handle)
    }

    /// Queries a truck and waits for its status report.
    ///
    /// # Errors
    ///
    /// Returns the error the query failed with, or
    /// [`LinkError::UnexpectedReply`] if the simulator answered with some
    /// other event.
    pub async fn query_truck(&self, truck_id: TruckId) -> LinkResult<TruckReport> {
        let handle = self.query(truck_id)?;
        let seq = handle.seq();
        match handle.wait().await? {
            Reply::TruckStatus(report) => Ok(report),
            other => Err(LinkError::UnexpectedReply {
                seq,
                got: other.kind(),
            }),
        }
    }

    /// Changes the simulation speed. No reply is expected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] outside the running phase.
    pub fn set_simulation_speed(&self, speed: u32) -> LinkResult<()> {
        let state = self.shared.state.lock().expect("lock poisoned");
        state
            .running_session()?
            .dispatcher()
            .enqueue(OutboundCommand::SetSpeed { speed })?;
        info!(speed, "simulation speed set");
        Ok(())
    }

    /// Probes the simulator with a status query for the configured probe
    /// truck, bounded by the probe timeout.
    pub async fn test_connection(&self) -> bool {
        let requests = &self.shared.config.requests;
        let probe = tokio::time::timeout(
            requests.health_probe_timeout,
            self.query_truck(requests.health_probe_truck),
        )
        .await;
        match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "connection probe failed");
                false
            },
            Err(_) => {
                debug!("connection probe timed out");
                false
            },
        }
    }

    /// Shallow health report built from the current state.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport::new(&self.connection_state(), self.pending_requests(), None)
    }

    /// Health report including a live probe when connected.
    pub async fn check_health(&self) -> HealthReport {
        let probe = if self.is_connected() {
            Some(self.test_connection().await)
        } else {
            None
        };
        HealthReport::new(&self.connection_state(), self.pending_requests(), probe)
    }

    /// Registers a request and queues its command under the state lock, so a
    /// concurrent teardown either sees the request and fails it, or the
    /// request sees no session.
    fn submit<F>(&self, kind: RequestKind, timeout: Duration, build: F) -> LinkResult<ReplyHandle>
    where
        F: FnOnce(i64) -> OutboundCommand,
    {
        let state = self.shared.state.lock().expect("lock poisoned");
        let session = state.running_session()?;
        let seq = self.shared.sequence.next();
        let handle = self.shared.correlator.register(seq, kind, timeout)?;
        if let Err(e) = session.dispatcher().enqueue(build(seq)) {
            self.shared.correlator.remove(seq);
            return Err(e);
        }
        Ok(handle)
    }
}

impl Drop for SimulatorLink {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
