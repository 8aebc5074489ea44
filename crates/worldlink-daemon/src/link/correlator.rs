//! Response correlation.
//!
//! Every command that expects a reply registers a pending request under its
//! sequence number. The reader completes it, the sweeper expires it, and a
//! disconnect or connection loss fails it. Whichever comes first wins: the
//! entry is removed from the map under the lock, so a pending request is
//! resolved exactly once.
//!
//! Result slots are `oneshot` channels. Sending happens after the lock is
//! released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{LinkError, LinkResult};
use crate::protocol::{Completion, DeliveryMade, SeqNum, TruckReport};

/// Allocates sequence numbers.
///
/// Lives for the whole link and is never reset, so numbers stay unique
/// across reconnects.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicI64,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    /// Starts at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> SeqNum {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Kind of request awaiting a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Pickup trip.
    Pickup,
    /// Delivery run.
    Deliver,
    /// Status query.
    Query,
}

impl RequestKind {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Deliver => "deliver",
            Self::Query => "query",
        }
    }
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A trip finished.
    Completed(Completion),
    /// A package was delivered.
    Delivered(DeliveryMade),
    /// A status report.
    TruckStatus(TruckReport),
}

impl Reply {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completion",
            Self::Delivered(_) => "delivery",
            Self::TruckStatus(_) => "truck status",
        }
    }
}

type Slot = oneshot::Sender<LinkResult<Reply>>;

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    timeout: Duration,
    deadline: Instant,
    acknowledged: bool,
    slot: Slot,
}

/// Awaitable side of a pending request.
#[derive(Debug)]
pub struct ReplyHandle {
    seq: SeqNum,
    kind: RequestKind,
    rx: oneshot::Receiver<LinkResult<Reply>>,
}

impl ReplyHandle {
    /// Sequence number of the request.
    #[must_use]
    pub const fn seq(&self) -> SeqNum {
        self.seq
    }

    /// Kind of the request.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns the failure the request was resolved with. If the correlator
    /// itself went away the request reports [`LinkError::ConnectionClosed`].
    pub async fn wait(self) -> LinkResult<Reply> {
        self.rx.await.unwrap_or(Err(LinkError::ConnectionClosed))
    }
}

/// Map of outstanding requests keyed by sequence number.
#[derive(Debug, Default)]
pub struct ResponseCorrelator {
    pending: Mutex<HashMap<SeqNum, PendingRequest>>,
}

impl ResponseCorrelator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request with a deadline `timeout` from now.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::DuplicateSequence`] if `seq` is already pending.
    pub fn register(
        &self,
        seq: SeqNum,
        kind: RequestKind,
        timeout: Duration,
    ) -> LinkResult<ReplyHandle> {
        let (slot, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("lock poisoned");
        if pending.contains_key(&seq) {
            return Err(LinkError::DuplicateSequence(seq));
        }
        pending.insert(
            seq,
            PendingRequest {
                kind,
                timeout,
                deadline: Instant::now() + timeout,
                acknowledged: false,
                slot,
            },
        );
        Ok(ReplyHandle { seq, kind, rx })
    }

    /// Resolves the request for `seq`.
    ///
    /// Returns `false` if nothing was pending, which happens for late or
    /// duplicate replies.
    pub fn complete(&self, seq: SeqNum, result: LinkResult<Reply>) -> bool {
        let entry = self.pending.lock().expect("lock poisoned").remove(&seq);
        let Some(request) = entry else {
            debug!(seq, "dropping reply for unknown seq");
            return false;
        };
        debug!(seq, kind = request.kind.as_str(), ok = result.is_ok(), "request resolved");
        // The caller may have dropped its handle.
        let _ = request.slot.send(result);
        true
    }

    /// Records that the simulator received command `seq`.
    pub fn acknowledge(&self, seq: SeqNum) -> bool {
        let mut pending = self.pending.lock().expect("lock poisoned");
        match pending.get_mut(&seq) {
            Some(request) => {
                request.acknowledged = true;
                true
            },
            None => false,
        }
    }

    /// Removes a request without resolving it.
    ///
    /// Used when a command could not be queued after registration.
    pub fn remove(&self, seq: SeqNum) -> bool {
        self.pending.lock().expect("lock poisoned").remove(&seq).is_some()
    }

    /// Fails every request whose deadline is at or before `now`.
    ///
    /// Returns the number of expired requests.
    pub fn sweep_timeouts(&self, now: Instant) -> usize {
        let expired: Vec<(SeqNum, PendingRequest)> = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let seqs: Vec<SeqNum> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| pending.remove(&seq).map(|request| (seq, request)))
                .collect()
        };

        let count = expired.len();
        for (seq, request) in expired {
            warn!(
                seq,
                kind = request.kind.as_str(),
                acknowledged = request.acknowledged,
                "request timed out"
            );
            let _ = request.slot.send(Err(LinkError::timeout(
                seq,
                request.timeout,
                request.acknowledged,
            )));
        }
        count
    }

    /// Fails every pending request with the error produced by `error`.
    ///
    /// Returns the number of failed requests.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> LinkError,
    {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .expect("lock poisoned")
            .drain()
            .map(|(_, request)| request)
            .collect();
        let count = drained.len();
        for request in drained {
            let _ = request.slot.send(Err(error()));
        }
        count
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `seq` is pending.
    #[must_use]
    pub fn contains(&self, seq: SeqNum) -> bool {
        self.pending.lock().expect("lock poisoned").contains_key(&seq)
    }
}

/// Periodically expires overdue requests until `cancel` fires.
pub(crate) async fn run_sweeper(
    correlator: Arc<ResponseCorrelator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            now = ticker.tick() => {
                let expired = correlator.sweep_timeouts(now);
                if expired > 0 {
                    debug!(expired, remaining = correlator.len(), "timeout sweep");
                }
            },
        }
    }
}
