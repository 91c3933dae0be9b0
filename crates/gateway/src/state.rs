//! Shared application state, built once at startup and cloned into handlers.

use std::sync::Arc;

use {
    axum::{extract::FromRequestParts, http::request::Parts},
    tokio::sync::broadcast,
};

use berth_config::BerthConfig;
use berth_loops::Scheduler;
use berth_metering::SystemConfigStore;
use berth_protocol::{ControlEvent, TokenKeys};
use berth_tunnel::{DeviceLoginBroker, SqliteDeviceCodeStore, TunnelSessions};
use berth_vault::{CredentialStore, DeviceFlowBroker};
use berth_workspaces::{Orchestrator, Reapers};

use crate::{
    error::ApiError,
    identity::{IdentityStore, User},
    throttle::RequestThrottle,
};

pub struct AppState {
    pub config: BerthConfig,
    pub identity: Arc<IdentityStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub vault: Arc<CredentialStore>,
    pub oauth_flows: Arc<DeviceFlowBroker>,
    pub device_login: Arc<DeviceLoginBroker<SqliteDeviceCodeStore>>,
    pub tunnels: Arc<TunnelSessions>,
    pub keys: TokenKeys,
    pub events: broadcast::Sender<ControlEvent>,
    pub system_config: Arc<SystemConfigStore>,
    pub reapers: Arc<Reapers>,
    pub throttle: RequestThrottle,
}

/// Session-authenticated caller, extracted from `Authorization: Bearer`.
pub struct AuthedUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| berth_common::Error::auth_required("missing session token"))?;
        let user = state
            .identity
            .validate_session(&token)
            .await?
            .ok_or_else(|| berth_common::Error::auth_required("invalid or expired session"))?;
        Ok(Self(user))
    }
}

pub fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
