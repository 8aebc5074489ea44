//! Per-connection session.
//!
//! A session is built after a successful handshake and owns everything tied
//! to that one socket: the dispatcher feeding the writer, the reader, and
//! the timeout sweeper. Nothing is reused across connections; a reconnect
//! builds a new session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LinkShared;
use super::correlator::run_sweeper;
use super::dispatcher::{CommandDispatcher, run_writer};
use super::router::{InboundMessageRouter, ReaderExit, run_reader};
use super::supervisor;
use crate::protocol::{FrameCodec, OutboundCommand};

/// One live connection to the simulator.
#[derive(Debug)]
pub(crate) struct Session {
    id: u64,
    world_id: i64,
    dispatcher: CommandDispatcher,
    transport_open: Arc<AtomicBool>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    /// Splits `stream` and spawns the writer, reader and sweeper tasks.
    pub(crate) fn start(shared: &Arc<LinkShared>, id: u64, stream: TcpStream, world_id: i64) -> Self {
        let max_frame_size = shared.config.simulator.max_frame_size;
        let (read_half, write_half) = stream.into_split();
        let frames_in = FramedRead::new(read_half, FrameCodec::new(max_frame_size));
        let frames_out = FramedWrite::new(write_half, FrameCodec::new(max_frame_size));

        let cancel = shared.shutdown.child_token();
        let write_failed = CancellationToken::new();
        let transport_open = Arc::new(AtomicBool::new(true));
        let (dispatcher, queue) = CommandDispatcher::channel();

        let writer = tokio::spawn({
            let cancel = cancel.clone();
            let write_failed = write_failed.clone();
            let transport_open = Arc::clone(&transport_open);
            async move {
                match run_writer(queue, frames_out, cancel).await {
                    Ok(exit) => debug!(session = id, ?exit, "writer stopped"),
                    Err(e) => {
                        warn!(session = id, error = %e, "write to simulator failed");
                        transport_open.store(false, Ordering::SeqCst);
                        write_failed.cancel();
                    },
                }
            }
        });

        let router = InboundMessageRouter::new(
            Arc::clone(&shared.correlator),
            dispatcher.clone(),
            Arc::clone(&shared.sink),
            Arc::clone(&shared.fleet),
        );
        tokio::spawn({
            let shared = Arc::clone(shared);
            let cancel = cancel.clone();
            let transport_open = Arc::clone(&transport_open);
            async move {
                let exit = run_reader(&router, frames_in, &cancel, &write_failed).await;
                transport_open.store(false, Ordering::SeqCst);
                // Releases the router's dispatcher so a draining writer can finish.
                drop(router);
                match exit {
                    ReaderExit::Cancelled => debug!(session = id, "reader stopped"),
                    ReaderExit::Finished => {
                        shared.end_session(id, "simulator finished the world").await;
                    },
                    ReaderExit::TransportLost(error) => {
                        supervisor::connection_lost(&shared, id, &error);
                    },
                }
            }
        });

        tokio::spawn(run_sweeper(
            Arc::clone(&shared.correlator),
            shared.config.requests.sweep_interval,
            cancel.clone(),
        ));

        Self {
            id,
            world_id,
            dispatcher,
            transport_open,
            cancel,
            writer: Some(writer),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn world_id(&self) -> i64 {
        self.world_id
    }

    pub(crate) const fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Returns `false` once either direction of the socket has failed.
    pub(crate) fn is_transport_open(&self) -> bool {
        self.transport_open.load(Ordering::SeqCst) && !self.dispatcher.is_closed()
    }

    /// Sends a disconnect command, waits up to `grace` for it to be
    /// written, then stops every task.
    pub(crate) async fn close_gracefully(mut self, grace: Duration) {
        if self.dispatcher.enqueue(OutboundCommand::Disconnect).is_ok() {
            if let Some(writer) = self.writer.take() {
                if tokio::time::timeout(grace, writer).await.is_err() {
                    debug!(session = self.id, "disconnect not flushed within grace period");
                }
            }
        }
        self.cancel.cancel();
    }

    /// Lets the writer send everything already queued, waiting up to
    /// `grace`, then stops every task.
    pub(crate) async fn drain(mut self, grace: Duration) {
        let (closed, _) = CommandDispatcher::channel();
        drop(std::mem::replace(&mut self.dispatcher, closed));
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(grace, writer).await.is_err() {
                debug!(session = self.id, "queued frames not flushed within grace period");
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
