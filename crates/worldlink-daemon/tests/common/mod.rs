//! Fake world simulator for integration tests.
//!
//! Listens on a loopback port and speaks the simulator side of the wire
//! protocol one frame at a time, so tests control exactly what the link
//! sees and when.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use worldlink_core::LinkConfig;
use worldlink_core::fleet::TruckSnapshot;
use worldlink_daemon::link::{FleetEventSink, InMemoryFleet, SimulatorLink};
use worldlink_daemon::protocol::messages::{UCommands, UConnect, UConnected, UResponses};
use worldlink_daemon::protocol::{CONNECTED_RESULT, read_frame, write_frame};

/// Upper bound on any single wait in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Listening fake simulator.
pub struct FakeSimulator {
    listener: TcpListener,
}

impl FakeSimulator {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accepts one connection and reads its connect request.
    pub async fn accept_raw(&self) -> (SimConnection, UConnect) {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("link did not connect in time")
            .unwrap();
        let mut conn = SimConnection { stream };
        let payload = conn.read_payload().await;
        let connect = UConnect::decode(payload.as_slice()).unwrap();
        (conn, connect)
    }

    /// Accepts a connection and answers the handshake with `result`.
    pub async fn accept_with(&self, world_id: i64, result: &str) -> (SimConnection, UConnect) {
        let (mut conn, connect) = self.accept_raw().await;
        conn.answer_handshake(world_id, result).await;
        (conn, connect)
    }

    /// Accepts a connection, admits it to `world_id`, and consumes the
    /// initial speed command.
    pub async fn accept(&self, world_id: i64) -> (SimConnection, UConnect) {
        let (mut conn, connect) = self.accept_with(world_id, CONNECTED_RESULT).await;
        let speed = conn.recv().await;
        assert_eq!(speed.simspeed, Some(1000), "expected default speed first");
        (conn, connect)
    }
}

/// One accepted connection.
pub struct SimConnection {
    stream: TcpStream,
}

impl SimConnection {
    async fn read_payload(&mut self) -> Vec<u8> {
        tokio::time::timeout(STEP_TIMEOUT, read_frame(&mut self.stream, 1 << 20))
            .await
            .expect("no frame from link in time")
            .unwrap()
    }

    /// Writes the handshake reply.
    pub async fn answer_handshake(&mut self, world_id: i64, result: &str) {
        let reply = UConnected {
            worldid: world_id,
            result: result.to_string(),
        };
        write_frame(&mut self.stream, &reply.encode_to_vec())
            .await
            .unwrap();
    }

    /// Reads the next command envelope.
    pub async fn recv(&mut self) -> UCommands {
        let payload = self.read_payload().await;
        UCommands::decode(payload.as_slice()).unwrap()
    }

    /// Reads envelopes until one satisfies `pred`.
    pub async fn recv_until<F>(&mut self, pred: F) -> UCommands
    where
        F: Fn(&UCommands) -> bool,
    {
        loop {
            let envelope = self.recv().await;
            if pred(&envelope) {
                return envelope;
            }
        }
    }

    /// Sends a response envelope.
    pub async fn send(&mut self, responses: &UResponses) {
        write_frame(&mut self.stream, &responses.encode_to_vec())
            .await
            .unwrap();
    }
}

/// Link configuration pointed at `port` with short test timings.
pub fn test_config(port: u16) -> LinkConfig {
    let mut config = LinkConfig::default();
    config.simulator.host = "127.0.0.1".to_string();
    config.simulator.port = port;
    config.simulator.connect_timeout = Duration::from_secs(2);
    config.reconnect.initial_delay = Duration::from_millis(50);
    config.reconnect.max_delay = Duration::from_millis(200);
    config.requests.sweep_interval = Duration::from_millis(50);
    config.requests.disconnect_grace = Duration::from_millis(200);
    config
}

/// Two idle trucks at the origin.
pub fn two_trucks() -> Vec<TruckSnapshot> {
    vec![TruckSnapshot::idle(1, 0, 0), TruckSnapshot::idle(2, 0, 0)]
}

/// A link with an in-memory fleet that knows `trucks`.
pub fn new_link(config: LinkConfig, trucks: &[TruckSnapshot]) -> (SimulatorLink, Arc<InMemoryFleet>) {
    let fleet = Arc::new(InMemoryFleet::new(trucks.to_vec()));
    let sink: Arc<dyn FleetEventSink> = fleet.clone();
    let link = SimulatorLink::new(config, sink);
    (link, fleet)
}

/// Polls `cond` until it holds.
pub async fn wait_for<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
