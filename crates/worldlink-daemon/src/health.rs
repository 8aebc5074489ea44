//! Link health reporting.
//!
//! The simulator is an optional dependency of the backend: a link that was
//! never connected reports [`HealthStatus::NotConnected`] rather than
//! [`HealthStatus::Down`]. Only a link that should be working but is not,
//! or has given up reconnecting, is down.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::link::{ConnectionState, LinkPhase};

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connected with an open transport (and a passing probe, if run).
    Up,
    /// Not connected, and not expected to be.
    NotConnected,
    /// Connected but failing, recovering, or given up.
    Down,
}

/// Serializable health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall classification.
    pub status: HealthStatus,
    /// Logically connected.
    pub connected: bool,
    /// Connected with both directions of the transport open.
    pub healthy: bool,
    /// Lifecycle phase.
    pub phase: LinkPhase,
    /// Current or last world id.
    pub world_id: Option<i64>,
    /// Requests awaiting a reply.
    pub pending_requests: usize,
    /// A reconnection loop is active.
    pub reconnecting: bool,
    /// Result of the live probe, when one was run.
    pub probe: Option<bool>,
    /// Human-readable summary.
    pub message: String,
    /// When the report was built.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Builds a report from a connection snapshot.
    #[must_use]
    pub fn new(state: &ConnectionState, pending_requests: usize, probe: Option<bool>) -> Self {
        let healthy = state.connected && state.running;
        let (status, message) = classify(state, healthy, probe);
        Self {
            status,
            connected: state.connected,
            healthy,
            phase: state.phase,
            world_id: state.world_id,
            pending_requests,
            reconnecting: state.reconnecting,
            probe,
            message,
            checked_at: Utc::now(),
        }
    }

    /// Returns `true` unless the link is down.
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.status != HealthStatus::Down
    }
}

fn classify(state: &ConnectionState, healthy: bool, probe: Option<bool>) -> (HealthStatus, String) {
    let world = state
        .world_id
        .map_or_else(|| "unknown".to_string(), |id| id.to_string());
    match state.phase {
        LinkPhase::Running if healthy && probe != Some(false) => (
            HealthStatus::Up,
            format!("connected to world {world}"),
        ),
        LinkPhase::Running if healthy => (
            HealthStatus::Down,
            format!("connected to world {world} but the probe query failed"),
        ),
        LinkPhase::Running => (
            HealthStatus::Down,
            format!("connected to world {world} but the transport is closed"),
        ),
        LinkPhase::Disconnected | LinkPhase::Connecting => (
            HealthStatus::NotConnected,
            "world simulator not connected (optional service)".to_string(),
        ),
        LinkPhase::ConnectionLost | LinkPhase::Reconnecting => (
            HealthStatus::Down,
            format!("reconnecting to world {world}"),
        ),
        LinkPhase::Stopped => (
            HealthStatus::Down,
            format!(
                "gave up reconnecting: {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(phase: LinkPhase, connected: bool, running: bool) -> ConnectionState {
        ConnectionState {
            phase,
            world_id: Some(77),
            connected,
            running,
            reconnecting: phase == LinkPhase::Reconnecting,
            last_error: Some("connection refused".to_string()),
        }
    }

    #[test]
    fn test_running_and_open_is_up() {
        let report = HealthReport::new(&state(LinkPhase::Running, true, true), 2, Some(true));
        assert_eq!(report.status, HealthStatus::Up);
        assert!(report.healthy);
        assert!(report.message.contains("77"));
        assert_eq!(report.pending_requests, 2);
    }

    #[test]
    fn test_failed_probe_is_down() {
        let report = HealthReport::new(&state(LinkPhase::Running, true, true), 0, Some(false));
        assert_eq!(report.status, HealthStatus::Down);
        assert!(!report.is_acceptable());
    }

    #[test]
    fn test_disconnected_is_optional() {
        let report = HealthReport::new(&state(LinkPhase::Disconnected, false, false), 0, None);
        assert_eq!(report.status, HealthStatus::NotConnected);
        assert!(report.is_acceptable());
        assert!(report.message.contains("optional"));
    }

    #[test]
    fn test_stopped_reports_last_error() {
        let report = HealthReport::new(&state(LinkPhase::Stopped, false, false), 0, None);
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.message.contains("connection refused"));
    }

    #[test]
    fn test_report_serializes() {
        let report = HealthReport::new(&state(LinkPhase::Reconnecting, false, false), 1, None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "down");
        assert_eq!(json["phase"], "reconnecting");
        assert_eq!(json["reconnecting"], true);
        assert_eq!(json["world_id"], 77);
    }
}
