//! Typed control-plane events fanned out to UI subscribers.
//!
//! The gateway owns a broadcast channel of [`ControlEvent`]; slow subscribers
//! lag and drop rather than blocking emitters.

use serde::{Deserialize, Serialize};

use berth_common::types::{RunStatus, WorkspaceStatus};

/// Emitted on every workspace state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatusEvent {
    pub workspace_id: String,
    pub status: WorkspaceStatus,
    pub user_id: String,
    pub domain: String,
    pub updated_at: String,
}

/// Emitted when an agent-loop run changes status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusEvent {
    pub loop_id: String,
    pub run_id: String,
    pub run_number: i64,
    pub status: RunStatus,
    pub user_id: String,
    pub updated_at: String,
}

/// Union of events the UI layer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ControlEvent {
    WorkspaceStatus(WorkspaceStatusEvent),
    RunStatus(RunStatusEvent),
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_event_serializes_camel_case() {
        let event = ControlEvent::WorkspaceStatus(WorkspaceStatusEvent {
            workspace_id: "ws-1".into(),
            status: WorkspaceStatus::Pending,
            user_id: "user-1".into(),
            domain: "demo.example.dev".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "workspace-status");
        assert_eq!(json["workspaceId"], "ws-1");
        assert_eq!(json["status"], "pending");
    }
}
