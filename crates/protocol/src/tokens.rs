//! Signed tokens: workspace JWTs, tunnel JWTs, and long-lived agent tokens.
//!
//! All three are HS256 JWTs signed with the control plane's token secret.
//! Scope strings gate what each token may do.

use std::collections::HashMap;

use {
    jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode},
    serde::{Deserialize, Serialize},
};

use berth_common::{Error, Result};

use crate::frames::ExposedPort;

pub mod scopes {
    /// Workspace-internal callers (git operations, heartbeat).
    pub const GIT_ALL: &str = "git:*";
    /// A tunnel agent attaching its WebSocket.
    pub const TUNNEL_CONNECT: &str = "tunnel:connect";
    /// A device-code-authenticated agent redeeming tunnel tokens.
    pub const AGENT_ALL: &str = "agent:*";
}

/// Claims for the JWT injected into a workspace's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceClaims {
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub scope: String,
    pub exp: i64,
}

/// Claims for the short-lived tunnel JWT presented in the `auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClaims {
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub subdomain: String,
    #[serde(rename = "exposedPorts", default)]
    pub exposed_ports: HashMap<String, ExposedPort>,
    pub scope: String,
    pub exp: i64,
}

/// Claims for the long-lived agent token issued by device-code login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub scope: String,
    pub exp: i64,
}

/// Signing/verification keys, derived once at startup from the operator's
/// token secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn mint_workspace(&self, workspace_id: &str, user_id: &str) -> Result<String> {
        let claims = WorkspaceClaims {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            scope: scopes::GIT_ALL.to_string(),
            exp: berth_common::time::now().timestamp() + crate::WORKSPACE_TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::internal(format!("token mint failed: {e}")))
    }

    pub fn verify_workspace(&self, token: &str) -> Result<WorkspaceClaims> {
        let data = decode::<WorkspaceClaims>(token, &self.decoding, &Validation::default())
            .map_err(|_| Error::auth_required("invalid workspace token"))?;
        if data.claims.scope != scopes::GIT_ALL {
            return Err(Error::forbidden("token lacks workspace scope"));
        }
        Ok(data.claims)
    }

    pub fn mint_tunnel(
        &self,
        workspace_id: &str,
        user_id: &str,
        subdomain: &str,
        exposed_ports: HashMap<String, ExposedPort>,
    ) -> Result<String> {
        let claims = TunnelClaims {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            subdomain: subdomain.to_string(),
            exposed_ports,
            scope: scopes::TUNNEL_CONNECT.to_string(),
            exp: berth_common::time::now().timestamp() + crate::TUNNEL_TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::internal(format!("token mint failed: {e}")))
    }

    pub fn verify_tunnel(&self, token: &str) -> Result<TunnelClaims> {
        let data = decode::<TunnelClaims>(token, &self.decoding, &Validation::default())
            .map_err(|_| Error::auth_required("invalid tunnel token"))?;
        if data.claims.scope != scopes::TUNNEL_CONNECT {
            return Err(Error::forbidden("token lacks tunnel scope"));
        }
        Ok(data.claims)
    }

    pub fn mint_agent(&self, user_id: &str) -> Result<String> {
        let claims = AgentClaims {
            user_id: user_id.to_string(),
            scope: scopes::AGENT_ALL.to_string(),
            exp: berth_common::time::now().timestamp() + crate::AGENT_TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::internal(format!("token mint failed: {e}")))
    }

    pub fn verify_agent(&self, token: &str) -> Result<AgentClaims> {
        let data = decode::<AgentClaims>(token, &self.decoding, &Validation::default())
            .map_err(|_| Error::auth_required("invalid agent token"))?;
        if data.claims.scope != scopes::AGENT_ALL {
            return Err(Error::forbidden("token lacks agent scope"));
        }
        Ok(data.claims)
    }
}
