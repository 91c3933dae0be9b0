//! Compute-provider abstraction: the seam between the orchestrator and the
//! machines that actually host workspaces and sandbox runs.
//!
//! Three backends implement [`ComputeProvider`]:
//! - [`CloudBackend`] drives a deployment HTTP API;
//! - [`LocalBackend`] is a no-op shell (the runtime is the user's machine,
//!   attached over the tunnel);
//! - [`SandboxBackend`] only dispatches agent-loop runs.

pub mod catalog;
pub mod cloud;
pub mod local;
pub mod provider;
pub mod registry;
pub mod sandbox;

pub use {
    catalog::{AgentTypeRow, CatalogStore, CatalogTable, CloudProviderRow, ImageRow, RegionRow},
    cloud::CloudBackend,
    local::LocalBackend,
    provider::{
        ComputeProvider, CreateWorkspaceRequest, CreatedVolume, CreatedWorkspace, ProvisionError,
        RunDescriptor, SandboxAck,
    },
    registry::{BackendSettings, ProviderRegistry},
    sandbox::SandboxBackend,
};
