//! HTTP/WS surface of the control plane: protected RPC for browser sessions,
//! workspace- and agent-authenticated endpoints, internal RPC, the sandbox
//! callback, the tunnel upgrade, and the public subdomain proxy.

pub mod error;
pub mod identity;
pub mod routes_api;
pub mod routes_internal;
pub mod routes_tunnel;
pub mod server;
pub mod state;
pub mod throttle;

pub use {
    error::ApiError,
    identity::{IdentityStore, User},
    server::{build_app, build_services},
    state::AppState,
};
