//! Reconnection after transport failure.
//!
//! Only the reader reports connection loss. The first report for the live
//! session drains it and, if reconnection is enabled, starts a single
//! backoff loop. Reports for sessions that are already gone are ignored, and
//! the loop token stored in the link state keeps a second loop from
//! starting while one runs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::LinkError;
use super::{LinkPhase, LinkShared};
use crate::protocol::ProtocolError;

/// Handles a transport failure reported by the reader of `session_id`.
pub(crate) fn connection_lost(shared: &Arc<LinkShared>, session_id: u64, cause: &ProtocolError) {
    let (session, token) = {
        let mut state = shared.state.lock().expect("lock poisoned");
        if state.session.as_ref().map(|s| s.id()) != Some(session_id) {
            debug!(session = session_id, "ignoring loss of a retired session");
            return;
        }
        warn!(
            session = session_id,
            world_id = ?state.world_id,
            error = %cause,
            "connection to world simulator lost"
        );
        let session = state.session.take();
        state.phase = LinkPhase::ConnectionLost;
        state.last_error = Some(cause.to_string());

        let token = if shared.config.reconnect.enabled && state.reconnect.is_none() {
            let token = shared.shutdown.child_token();
            state.reconnect = Some(token.clone());
            Some(token)
        } else {
            None
        };
        if token.is_none() && state.reconnect.is_none() {
            state.phase = LinkPhase::Disconnected;
        }
        (session, token)
    };

    drop(session);
    let failed = shared.correlator.fail_all(|| LinkError::ConnectionLost);
    if failed > 0 {
        info!(failed, "failed in-flight requests after connection loss");
    }

    if let Some(token) = token {
        tokio::spawn(reconnect(Arc::clone(shared), token));
    } else if !shared.config.reconnect.enabled {
        info!("reconnection disabled; link stays disconnected");
    }
}

/// Retries the connection on the configured backoff schedule.
///
/// The first attempt is immediate. Each failed attempt is followed by the
/// next delay of the schedule, except the last, after which the link stops.
async fn reconnect(shared: Arc<LinkShared>, token: CancellationToken) {
    let policy = shared.config.reconnect.clone();
    let world_id = shared.state.lock().expect("lock poisoned").world_id;

    let mut schedule = policy.schedule().enumerate().peekable();
    while let Some((index, delay)) = schedule.next() {
        let attempt = index + 1;
        {
            let mut state = shared.state.lock().expect("lock poisoned");
            if token.is_cancelled() {
                return;
            }
            state.phase = LinkPhase::Reconnecting;
        }
        info!(
            attempt,
            max_attempts = policy.max_attempts,
            "reconnecting to world simulator"
        );

        let outcome = {
            let _guard = shared.connect_lock.lock().await;
            if token.is_cancelled() {
                return;
            }
            let trucks = shared.fleet.snapshot();
            tokio::select! {
                () = token.cancelled() => Ok(None),
                outcome = shared.establish(world_id, &trucks, Some(&token)) => outcome,
            }
        };
        match outcome {
            Ok(Some(world_id)) => {
                info!(attempt, world_id, "reconnected to world simulator");
                return;
            },
            Ok(None) => {
                info!("reconnection cancelled");
                return;
            },
            Err(e) => {
                warn!(attempt, error = %e, "reconnection attempt failed");
                let mut state = shared.state.lock().expect("lock poisoned");
                if !token.is_cancelled() {
                    state.last_error = Some(e.to_string());
                }
            },
        }

        if schedule.peek().is_none() {
            break;
        }
        debug!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before next reconnection attempt"
        );
        tokio::select! {
            () = token.cancelled() => {
                info!("reconnection cancelled");
                return;
            },
            () = tokio::time::sleep(delay) => {},
        }
    }

    let mut state = shared.state.lock().expect("lock poisoned");
    if token.is_cancelled() {
        return;
    }
    error!(
        max_attempts = policy.max_attempts,
        "giving up on the world simulator"
    );
    state.reconnect = None;
    state.phase = LinkPhase::Stopped;
}
