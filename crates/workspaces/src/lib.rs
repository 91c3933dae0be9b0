//! Workspace orchestration: admission, the lifecycle state machine,
//! heartbeat liveness, and the reaping jobs.

pub mod git;
pub mod orchestrator;
pub mod reapers;
pub mod store;
pub mod subdomain;

pub use {
    git::{ForkedRepository, GitTokenProvider, InstallationToken, NoopGitTokens},
    orchestrator::{
        CreateWorkspaceParams, HeartbeatAction, HeartbeatResponse, Orchestrator,
        OrchestratorConfig, UserContext,
    },
    reapers::{AdvisoryLease, PlanLookup, Reapers},
    store::{Volume, Workspace, WorkspaceGitConfig, WorkspaceStore},
};
