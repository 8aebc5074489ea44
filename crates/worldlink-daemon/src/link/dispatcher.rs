//! Command dispatch and the writer loop.
//!
//! Callers enqueue [`OutboundCommand`]s without blocking. A single writer
//! task per session drains the queue and is the only code that writes to
//! the socket.
//!
//! Acknowledgements travel on their own channel. The writer folds every
//! queued ack batch into the next frame it sends, whether that frame carries
//! a command or nothing but acks. Non-ack commands keep their enqueue order.

use bytes::Bytes;
use futures::SinkExt;
use prost::Message;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{LinkError, LinkResult};
use crate::protocol::{FrameCodec, OutboundCommand, ProtocolResult, SeqNum, UCommands};

/// Producer side of a session's outbound queue.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    commands: mpsc::UnboundedSender<OutboundCommand>,
    acks: mpsc::UnboundedSender<Vec<SeqNum>>,
}

/// Consumer side, owned by the writer.
#[derive(Debug)]
pub struct DispatchQueue {
    commands: mpsc::UnboundedReceiver<OutboundCommand>,
    acks: mpsc::UnboundedReceiver<Vec<SeqNum>>,
}

impl CommandDispatcher {
    /// Creates a dispatcher and the queue its writer drains.
    #[must_use]
    pub fn channel() -> (Self, DispatchQueue) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: commands_tx,
                acks: acks_tx,
            },
            DispatchQueue {
                commands: commands_rx,
                acks: acks_rx,
            },
        )
    }

    /// Queues a command for the writer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] if the writer has stopped.
    pub fn enqueue(&self, command: OutboundCommand) -> LinkResult<()> {
        match command {
            OutboundCommand::AckBatch { seqs } => {
                if seqs.is_empty() {
                    return Ok(());
                }
                self.acks.send(seqs).map_err(|_| LinkError::NotConnected)
            },
            other => self
                .commands
                .send(other)
                .map_err(|_| LinkError::NotConnected),
        }
    }

    /// Returns `true` once the writer has dropped its queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Why the writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// A disconnect command was written.
    Disconnected,
    /// The session was cancelled.
    Cancelled,
    /// Every dispatcher was dropped.
    QueueClosed,
}

enum Next {
    Command(OutboundCommand),
    Acks(Vec<SeqNum>),
}

/// Drains `queue` into `frames` until cancelled, disconnected, or a write
/// fails.
///
/// # Errors
///
/// Returns the first encode or write error. The session treats it as loss
/// of the connection.
pub async fn run_writer<W>(
    mut queue: DispatchQueue,
    mut frames: FramedWrite<W, FrameCodec>,
    cancel: CancellationToken,
) -> ProtocolResult<WriterExit>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(WriterExit::Cancelled),
            command = queue.commands.recv() => match command {
                Some(command) => Next::Command(command),
                None => {
                    flush_acks(&mut queue, &mut frames).await?;
                    return Ok(WriterExit::QueueClosed);
                },
            },
            Some(acks) = queue.acks.recv() => Next::Acks(acks),
        };

        let (mut envelope, is_disconnect) = match next {
            Next::Command(command) => {
                debug!(kind = command.kind(), seq = ?command.seq(), "sending command");
                let is_disconnect = matches!(command, OutboundCommand::Disconnect);
                (command.into_envelope(), is_disconnect)
            },
            Next::Acks(seqs) => (OutboundCommand::AckBatch { seqs }.into_envelope(), false),
        };
        while let Ok(more) = queue.acks.try_recv() {
            envelope.acks.extend(more);
        }
        if !envelope.acks.is_empty() {
            debug!(acks = ?envelope.acks, "sending acks");
        }

        write_envelope(&mut frames, &envelope).await?;

        if is_disconnect {
            return Ok(WriterExit::Disconnected);
        }
    }
}

/// Writes whatever acks are still queued once every dispatcher is gone.
async fn flush_acks<W>(
    queue: &mut DispatchQueue,
    frames: &mut FramedWrite<W, FrameCodec>,
) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut seqs = Vec::new();
    while let Ok(more) = queue.acks.try_recv() {
        seqs.extend(more);
    }
    if seqs.is_empty() {
        return Ok(());
    }
    debug!(acks = ?seqs, "flushing acks before writer exits");
    write_envelope(frames, &OutboundCommand::AckBatch { seqs }.into_envelope()).await
}

async fn write_envelope<W>(
    frames: &mut FramedWrite<W, FrameCodec>,
    envelope: &UCommands,
) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    frames.send(Bytes::from(envelope.encode_to_vec())).await
}
