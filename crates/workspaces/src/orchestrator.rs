//! Admission, state transitions, and heartbeat handling.

use std::{collections::HashMap, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::broadcast,
    tracing::{info, warn},
};

use berth_common::{
    Error, Result,
    ids::new_id,
    time,
    types::{HostingType, Plan, StopSource, WorkspaceStatus},
};
use berth_compute::{CatalogStore, CreateWorkspaceRequest, ProviderRegistry};
use berth_metering::{SystemConfigKey, SystemConfigStore, UsageStore};
use berth_protocol::{
    ControlEvent, TokenKeys, WorkspaceClaims, WorkspaceStatusEvent, frames::ExposedPort,
};

use crate::{
    git::GitTokenProvider,
    store::{Workspace, WorkspaceStore},
    subdomain,
};

/// Soft cap on non-terminated workspaces per user.
const MAX_ACTIVE_WORKSPACES: i64 = 1;
/// Mount point for persistent volumes.
const VOLUME_MOUNT_PATH: &str = "/data";

#[derive(Debug, Clone)]
pub struct UserContext {
    pub id: String,
    pub email: String,
    pub plan: Plan,
    pub github_username: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorkspaceParams {
    pub name: Option<String>,
    pub agent_type_id: String,
    pub cloud_provider_id: String,
    pub region_id: String,
    pub repository_url: Option<String>,
    pub git_integration_id: Option<String>,
    pub persistent: bool,
    pub subdomain: Option<String>,
    /// User-configured extra environment variables.
    pub extra_env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_domain: String,
    pub public_api_url: String,
    pub admin_emails: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatAction {
    Continue,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub action: HeartbeatAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct Orchestrator {
    store: Arc<WorkspaceStore>,
    catalog: Arc<CatalogStore>,
    usage: Arc<UsageStore>,
    system_config: Arc<SystemConfigStore>,
    registry: Arc<ProviderRegistry>,
    tokens: TokenKeys,
    git: Arc<dyn GitTokenProvider>,
    events: broadcast::Sender<ControlEvent>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<WorkspaceStore>,
        catalog: Arc<CatalogStore>,
        usage: Arc<UsageStore>,
        system_config: Arc<SystemConfigStore>,
        registry: Arc<ProviderRegistry>,
        tokens: TokenKeys,
        git: Arc<dyn GitTokenProvider>,
        events: broadcast::Sender<ControlEvent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            usage,
            system_config,
            registry,
            tokens,
            git,
            events,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    #[must_use]
    pub fn usage(&self) -> &Arc<UsageStore> {
        &self.usage
    }

    fn emit_status(&self, ws: &Workspace) {
        let _ = self
            .events
            .send(ControlEvent::WorkspaceStatus(WorkspaceStatusEvent {
                workspace_id: ws.id.clone(),
                status: ws.status,
                user_id: ws.user_id.clone(),
                domain: ws.domain.clone(),
                updated_at: ws.updated_at.clone(),
            }));
    }

    fn is_admin(&self, user: &UserContext) -> bool {
        self.config
            .admin_emails
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&user.email))
    }

    async fn free_tier_minutes(&self) -> Result<i64> {
        self.system_config
            .get(SystemConfigKey::FreeTierDailyMinutes)
            .await
    }

    // ── Admission ────────────────────────────────────────────────────────

    pub async fn create_workspace(
        &self,
        user: &UserContext,
        params: CreateWorkspaceParams,
    ) -> Result<Workspace> {
        // Catalog resolution. Every row must exist and be enabled.
        let provider = self
            .catalog
            .provider(&params.cloud_provider_id)
            .await
            .map_err(Error::other)?
            .filter(|p| p.is_enabled)
            .ok_or_else(|| Error::bad_request("unknown or disabled cloud provider"))?;
        let region = self
            .catalog
            .region(&params.region_id)
            .await
            .map_err(Error::other)?
            .filter(|r| r.is_enabled)
            .ok_or_else(|| Error::bad_request("unknown or disabled region"))?;
        if region.cloud_provider_id != provider.id {
            return Err(Error::bad_request("region does not belong to provider"));
        }
        let agent_type = self
            .catalog
            .agent_type(&params.agent_type_id)
            .await
            .map_err(Error::other)?
            .filter(|a| a.is_enabled)
            .ok_or_else(|| Error::bad_request("unknown or disabled agent type"))?;
        let image = self
            .catalog
            .image_for_agent_type(&agent_type.id)
            .await
            .map_err(Error::other)?
            .ok_or_else(|| Error::bad_request("no enabled image for agent type"))?;

        let hosting = if provider.name.eq_ignore_ascii_case("local") {
            HostingType::Local
        } else {
            HostingType::Cloud
        };

        match hosting {
            HostingType::Cloud => {
                if agent_type.server_only {
                    return Err(Error::bad_request(
                        "agent type is restricted to local workspaces",
                    ));
                }
                if params.repository_url.is_none() {
                    return Err(Error::bad_request("repository is required"));
                }
                let limit = self.free_tier_minutes().await?;
                if !self
                    .usage
                    .has_remaining_quota(&user.id, user.plan, limit)
                    .await?
                {
                    return Err(Error::quota_exceeded("daily usage quota exhausted"));
                }
            },
            HostingType::Local => {
                if !agent_type.server_only {
                    return Err(Error::bad_request(
                        "local workspaces require a server-only agent type",
                    ));
                }
            },
        }

        // Concurrency cap, bypassed for designated admin accounts.
        if !self.is_admin(user) {
            let active = self.store.count_active_for_user(&user.id).await?;
            if active >= MAX_ACTIVE_WORKSPACES {
                return Err(Error::forbidden("too many workspaces"));
            }
        }

        let subdomain = self.resolve_subdomain(user, hosting, params.subdomain.as_deref()).await?;
        let domain = format!("{subdomain}.{}", self.config.base_domain);
        let workspace_id = new_id();

        let env = self
            .build_env(&workspace_id, user, &params, hosting)
            .await?;

        let request = CreateWorkspaceRequest {
            workspace_id: workspace_id.clone(),
            user_id: user.id.clone(),
            image_id: image.image_id.clone(),
            subdomain: subdomain.clone(),
            repo_url: params.repository_url.clone(),
            region_identifier: region.external_region_identifier.clone(),
            env,
            persistent: params.persistent,
        };

        let backend = self.registry.backend(&provider.id).await.map_err(Error::from)?;
        let created = if params.persistent {
            backend.create_persistent_workspace(&request).await?
        } else {
            backend.create_workspace(&request).await?
        };

        let now = time::now_rfc3339();
        let ws = Workspace {
            id: workspace_id.clone(),
            user_id: user.id.clone(),
            subdomain: subdomain.clone(),
            domain,
            name: params.name.unwrap_or_else(|| subdomain.clone()),
            cloud_provider_id: provider.id,
            region_id: region.id,
            image_id: image.id,
            external_instance_id: created.external_service_id,
            external_running_deployment_id: None,
            upstream_url: created.upstream_url,
            hosting_type: hosting,
            persistent: params.persistent,
            server_only: agent_type.server_only,
            git_integration_id: params.git_integration_id,
            repository_url: params.repository_url,
            status: WorkspaceStatus::Pending,
            started_at: None,
            last_active_at: Some(now.clone()),
            stopped_at: None,
            terminated_at: None,
            local_port: None,
            exposed_ports: None,
            tunnel_connected_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.insert(&ws).await?;

        if let Some(volume) = created.volume {
            self.store
                .insert_volume(&ws.id, &volume.external_volume_id, VOLUME_MOUNT_PATH)
                .await?;
        }
        if hosting == HostingType::Cloud {
            self.usage.open_usage_session(&ws.id, &user.id).await?;
        }

        info!(workspace_id = %ws.id, subdomain = %ws.subdomain, user_id = %user.id, "workspace admitted");
        self.emit_status(&ws);
        Ok(ws)
    }

    async fn resolve_subdomain(
        &self,
        user: &UserContext,
        hosting: HostingType,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(custom) = requested {
            subdomain::validate_custom(custom)?;
            if !subdomain::plan_allows_custom(user.plan, hosting) {
                return Err(Error::forbidden(
                    "plan does not permit custom subdomains",
                ));
            }
            if self.store.find_active_by_subdomain(custom).await?.is_some() {
                return Err(Error::bad_request("Subdomain already taken"));
            }
            return Ok(custom.to_string());
        }

        subdomain::generate(|candidate| async move {
            Ok(self
                .store
                .find_active_by_subdomain(&candidate)
                .await?
                .is_some())
        })
        .await
    }

    async fn build_env(
        &self,
        workspace_id: &str,
        user: &UserContext,
        params: &CreateWorkspaceParams,
        hosting: HostingType,
    ) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();

        if let Some(repo_url) = &params.repository_url {
            env.insert("REPO_URL".to_string(), repo_url.clone());
            if let Some((owner, name)) = parse_repo(repo_url) {
                env.insert("REPO_OWNER".to_string(), owner);
                env.insert("REPO_NAME".to_string(), name);
            }
        }
        if let Some(username) = &user.github_username {
            env.insert("USER_GITHUB_USERNAME".to_string(), username.clone());
        }

        // App-installation token fetch failures are non-fatal: the agent
        // inside can still work against public repos.
        if let Some(integration) = &params.git_integration_id {
            match self.git.installation_token(integration).await {
                Ok(token) => {
                    env.insert("GITHUB_APP_TOKEN".to_string(), token.token);
                    env.insert("GITHUB_APP_TOKEN_EXPIRY".to_string(), token.expires_at);
                },
                Err(e) => {
                    warn!(workspace_id, error = %e, "installation token fetch failed");
                },
            }
        }

        env.insert("WORKSPACE_ID".to_string(), workspace_id.to_string());
        env.insert(
            "WORKSPACE_AUTH_TOKEN".to_string(),
            self.tokens.mint_workspace(workspace_id, &user.id)?,
        );
        env.insert(
            "WORKSPACE_API_URL".to_string(),
            self.config.public_api_url.clone(),
        );

        let agent_config = serde_json::json!({
            "workspaceId": workspace_id,
            "hosting": hosting.as_str(),
            "apiUrl": self.config.public_api_url,
        });
        env.insert(
            "OPENCODE_CONFIG_BASE64".to_string(),
            base64_encode(agent_config.to_string().as_bytes()),
        );

        for (key, value) in &params.extra_env {
            env.insert(key.clone(), value.clone());
        }
        Ok(env)
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// External "deployed" signal: the provider reports the service is up.
    pub async fn mark_deployed(&self, workspace_id: &str, deployment_id: &str) -> Result<Workspace> {
        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;

        // Open a session before going running if none survived (restart path).
        if ws.hosting_type == HostingType::Cloud && !self.usage.has_open_session(&ws.id).await? {
            self.usage.open_usage_session(&ws.id, &ws.user_id).await?;
        }

        let ws = self.store.mark_running(workspace_id, Some(deployment_id)).await?;
        self.emit_status(&ws);
        Ok(ws)
    }

    /// Tunnel attach: port announcement from the local agent.
    pub async fn tunnel_connected(
        &self,
        workspace_id: &str,
        local_port: Option<u16>,
        exposed_ports: &HashMap<String, ExposedPort>,
    ) -> Result<Workspace> {
        self.store
            .update_ports(workspace_id, local_port, exposed_ports)
            .await?;

        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;
        let ws = if ws.status == WorkspaceStatus::Pending {
            let ws = self.store.mark_running(workspace_id, None).await?;
            self.emit_status(&ws);
            ws
        } else {
            self.store.touch_last_active(workspace_id).await?;
            ws
        };
        Ok(ws)
    }

    /// Manual stop by the owner.
    pub async fn stop_workspace(&self, workspace_id: &str, user: &UserContext) -> Result<Workspace> {
        self.store.get_owned(workspace_id, &user.id).await?;
        self.stop_internal(workspace_id, StopSource::Manual).await
    }

    /// Stop without ownership checks; reapers and internal RPC use this.
    pub async fn stop_internal(
        &self,
        workspace_id: &str,
        stop_source: StopSource,
    ) -> Result<Workspace> {
        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;

        let stopped = self.store.mark_stopped(workspace_id).await?;
        if ws.hosting_type == HostingType::Cloud {
            self.usage.close_usage_session(workspace_id, stop_source).await?;

            let region = self
                .catalog
                .region(&ws.region_id)
                .await
                .map_err(Error::other)?;
            let region_identifier = region
                .map(|r| r.external_region_identifier)
                .unwrap_or_default();
            let backend = self
                .registry
                .backend(&ws.cloud_provider_id)
                .await
                .map_err(Error::from)?;
            backend
                .stop_workspace(
                    &ws.external_instance_id,
                    &region_identifier,
                    ws.external_running_deployment_id.as_deref(),
                )
                .await?;
        }

        info!(workspace_id, stop_source = stop_source.as_str(), "workspace stopped");
        self.emit_status(&stopped);
        Ok(stopped)
    }

    /// Restart a stopped workspace: back to pending, quota permitting.
    pub async fn restart_workspace(
        &self,
        workspace_id: &str,
        user: &UserContext,
    ) -> Result<Workspace> {
        let ws = self.store.get_owned(workspace_id, &user.id).await?;
        if ws.status != WorkspaceStatus::Stopped {
            return Err(Error::bad_request("workspace is not stopped"));
        }

        if ws.hosting_type == HostingType::Cloud {
            let limit = self.free_tier_minutes().await?;
            if !self
                .usage
                .has_remaining_quota(&user.id, user.plan, limit)
                .await?
            {
                return Err(Error::quota_exceeded("daily usage quota exhausted"));
            }
        }

        let pending = self.store.mark_pending(workspace_id).await?;

        if ws.hosting_type == HostingType::Cloud {
            let region = self
                .catalog
                .region(&ws.region_id)
                .await
                .map_err(Error::other)?;
            let region_identifier = region
                .map(|r| r.external_region_identifier)
                .unwrap_or_default();
            let backend = self
                .registry
                .backend(&ws.cloud_provider_id)
                .await
                .map_err(Error::from)?;
            backend
                .restart_workspace(&ws.external_instance_id, &region_identifier, None)
                .await?;
        }

        info!(workspace_id, "workspace restarting");
        self.emit_status(&pending);
        Ok(pending)
    }

    /// Terminate by the owner.
    pub async fn delete_workspace(
        &self,
        workspace_id: &str,
        user: &UserContext,
    ) -> Result<Workspace> {
        self.store.get_owned(workspace_id, &user.id).await?;
        self.terminate_internal(workspace_id, StopSource::Manual).await
    }

    /// Terminate without ownership checks; the long-term reaper uses this.
    pub async fn terminate_internal(
        &self,
        workspace_id: &str,
        stop_source: StopSource,
    ) -> Result<Workspace> {
        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;
        if ws.status == WorkspaceStatus::Terminated {
            return Ok(ws);
        }

        let terminated = self.store.mark_terminated(workspace_id).await?;
        self.usage.close_usage_session(workspace_id, stop_source).await?;

        let volume = self.store.volume_for_workspace(workspace_id).await?;
        if ws.hosting_type == HostingType::Cloud {
            let backend = self
                .registry
                .backend(&ws.cloud_provider_id)
                .await
                .map_err(Error::from)?;
            backend
                .terminate_workspace(
                    &ws.external_instance_id,
                    volume.as_ref().map(|v| v.external_volume_id.as_str()),
                )
                .await?;
        }
        if ws.persistent {
            self.store.delete_volume(workspace_id).await?;
        }

        info!(workspace_id, "workspace terminated");
        self.emit_status(&terminated);
        Ok(terminated)
    }

    // ── Heartbeat ────────────────────────────────────────────────────────

    /// Heartbeat from the in-workspace agent, authenticated by its JWT.
    pub async fn heartbeat(
        &self,
        claims: &WorkspaceClaims,
        workspace_id: &str,
        plan: Plan,
    ) -> Result<HeartbeatResponse> {
        if claims.workspace_id != workspace_id {
            return Err(Error::forbidden("token does not match workspace"));
        }
        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;
        if ws.user_id != claims.user_id {
            return Err(Error::forbidden("token does not match workspace owner"));
        }

        if ws.hosting_type == HostingType::Cloud {
            let limit = self.free_tier_minutes().await?;
            if !self
                .usage
                .has_remaining_quota(&ws.user_id, plan, limit)
                .await?
            {
                return Ok(HeartbeatResponse {
                    action: HeartbeatAction::Shutdown,
                    reason: Some("quota_exhausted".into()),
                });
            }
        }

        self.store.touch_last_active(workspace_id).await?;
        Ok(HeartbeatResponse {
            action: HeartbeatAction::Continue,
            reason: None,
        })
    }

    // ── Fork ─────────────────────────────────────────────────────────────

    /// Fork the workspace's upstream repository under the owner's git
    /// integration and record the lineage. The agent inside the workspace
    /// drives this through the internal RPC.
    pub async fn fork_repository(&self, workspace_id: &str) -> Result<crate::git::ForkedRepository> {
        let ws = self
            .store
            .get(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))?;

        let repo_url = ws
            .repository_url
            .as_deref()
            .ok_or_else(|| Error::bad_request("workspace has no repository"))?;
        let (owner, name) = parse_repo(repo_url)
            .ok_or_else(|| Error::bad_request("workspace repository URL is malformed"))?;
        let integration = ws
            .git_integration_id
            .as_deref()
            .ok_or_else(|| Error::bad_request("workspace has no git integration"))?;

        let fork = self
            .git
            .fork_repository(integration, &owner, &name)
            .await?;
        self.store
            .record_fork(&ws.id, &owner, &name, &fork.owner, &fork.name, &fork.url)
            .await?;

        info!(workspace_id, fork = %fork.url, "repository forked");
        Ok(fork)
    }

    // ── Tunnel token mint ────────────────────────────────────────────────

    /// Mint a tunnel JWT for a local workspace owned by the caller.
    pub async fn mint_tunnel_token(&self, workspace_id: &str, user_id: &str) -> Result<String> {
        let ws = self.store.get_owned(workspace_id, user_id).await?;
        if ws.hosting_type != HostingType::Local {
            return Err(Error::bad_request("workspace is not tunnel-hosted"));
        }
        self.tokens.mint_tunnel(
            &ws.id,
            &ws.user_id,
            &ws.subdomain,
            ws.exposed_ports.unwrap_or_default(),
        )
    }
}

fn parse_repo(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim_end_matches(".git").trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let name = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    if owner.is_empty() || name.is_empty() || owner.contains(':') {
        return None;
    }
    Some((owner, name))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repo_variants() {
        assert_eq!(
            parse_repo("https://github.com/acme/app"),
            Some(("acme".into(), "app".into()))
        );
        assert_eq!(
            parse_repo("https://github.com/acme/app.git"),
            Some(("acme".into(), "app".into()))
        );
        assert_eq!(parse_repo("nonsense"), None);
    }

    #[test]
    fn base64_matches_standard() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }
}
