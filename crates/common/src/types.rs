//! Shared domain vocabulary: status enums persisted as lowercase strings.

use serde::{Deserialize, Serialize};

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Billing plan. Gates custom subdomains and the daily minute quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Tunnel,
    Pro,
}

impl Plan {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Tunnel => "tunnel",
            Self::Pro => "pro",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "tunnel" => Some(Self::Tunnel),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }
}

/// Workspace lifecycle status.
///
/// Transitions only along `pending → running`, `pending|running → stopped`,
/// `stopped → pending` (restart), `{any} → terminated`. Nothing leaves
/// `terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
}

impl WorkspaceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Whether the state machine admits `self → to`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (_, Self::Terminated) => self != Self::Terminated,
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Stopped) => true,
            (Self::Stopped, Self::Pending) => true,
            _ => false,
        }
    }
}

/// How the workspace is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostingType {
    Cloud,
    Local,
}

impl HostingType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cloud" => Some(Self::Cloud),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Why a usage session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    Manual,
    Idle,
    QuotaExhausted,
    Error,
}

impl StopSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Idle => "idle",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Error => "error",
        }
    }
}

/// Agent loop status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl LoopStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Agent loop run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Halted,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Halted => "halted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "halted" => Some(Self::Halted),
            _ => None,
        }
    }

    /// A run that still occupies its loop's single in-flight slot.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Automated,
}

impl TriggerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automated => "automated",
        }
    }
}

/// How a model credential authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Oauth,
}

impl AuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Oauth => "oauth",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api_key" => Some(Self::ApiKey),
            "oauth" => Some(Self::Oauth),
            _ => None,
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_transitions() {
        use WorkspaceStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Pending));
        assert!(Running.can_transition_to(Terminated));
        assert!(Stopped.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Pending));
        assert!(!Terminated.can_transition_to(Terminated));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkspaceStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&StopSource::QuotaExhausted).unwrap(),
            "\"quota_exhausted\""
        );
        assert_eq!(serde_json::to_string(&AuthType::ApiKey).unwrap(), "\"api_key\"");
    }

    #[test]
    fn run_status_in_flight() {
        assert!(RunStatus::Pending.is_in_flight());
        assert!(RunStatus::Running.is_in_flight());
        assert!(!RunStatus::Halted.is_in_flight());
        assert!(!RunStatus::Completed.is_in_flight());
    }

    #[test]
    fn plan_round_trip() {
        for plan in [Plan::Free, Plan::Tunnel, Plan::Pro] {
            assert_eq!(Plan::parse(plan.as_str()), Some(plan));
        }
        assert_eq!(Plan::parse("enterprise"), None);
    }
}
