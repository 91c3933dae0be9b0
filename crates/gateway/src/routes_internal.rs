//! Internal RPC (shared-secret header), the workspace-JWT heartbeat, and the
//! sandbox executor's completion webhook.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        extract::{Path, Request, State},
        http::request::Parts,
        middleware::{self, Next},
        response::Response,
        routing::{get, post},
    },
    chrono::Duration as ChronoDuration,
    serde::Deserialize,
    serde_json::json,
};

use berth_common::{Error, time, types::StopSource};
use berth_loops::CallbackParams;
use berth_metering::SystemConfigKey;

use crate::{
    error::{ApiError, ApiResult},
    state::{AppState, bearer_token},
};

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/validate-session", post(validate_session))
        .route("/users", post(upsert_user))
        .route("/sessions", post(create_session))
        .route("/workspaces/by-subdomain/{subdomain}", get(workspace_by_subdomain))
        .route("/workspaces/idle", get(idle_workspaces))
        .route("/workspaces/quota-exceeded", get(quota_exceeded_workspaces))
        .route("/workspaces/{id}/heartbeat", post(update_heartbeat))
        .route("/workspaces/{id}/stop", post(stop_workspace_internal))
        .route("/workspaces/{id}/terminate", post(terminate_workspace_internal))
        .route("/workspaces/{id}/fork", post(fork_repository))
        .route("/webhooks/deploy", post(deploy_webhook))
        .route("/webhooks/github-installation", post(github_installation_webhook))
        .layer(middleware::from_fn_with_state(state, require_internal_key))
}

/// Every `/internal/*` call must present the shared `x-internal-key`.
async fn require_internal_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get("x-internal-key")
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.config.secrets.internal_key.as_str())
        || state.config.secrets.internal_key.is_empty()
    {
        return Err(Error::auth_required("invalid internal key").into());
    }
    Ok(next.run(request).await)
}

// ── Identity plumbing for the external auth service ─────────────────────────

#[derive(Debug, Deserialize)]
struct ValidateSessionBody {
    token: String,
}

async fn validate_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateSessionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state.identity.validate_session(&body.token).await?;
    Ok(Json(json!({ "user": user })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertUserBody {
    email: String,
    display_name: String,
    github_username: Option<String>,
}

async fn upsert_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertUserBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .identity
        .upsert_user(&body.email, &body.display_name, body.github_username.as_deref())
        .await?;
    Ok(Json(json!({ "user": user })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    user_id: String,
    #[serde(default = "default_session_ttl_days")]
    ttl_days: i64,
}

fn default_session_ttl_days() -> i64 {
    30
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = state
        .identity
        .create_session(&body.user_id, body.ttl_days)
        .await?;
    Ok(Json(json!({ "token": token })))
}

// ── Workspace lookups and lifecycle ──────────────────────────────────────────

async fn workspace_by_subdomain(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .store()
        .find_active_by_subdomain(&subdomain)
        .await?
        .ok_or_else(|| Error::not_found("workspace not found"))?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn idle_workspaces(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let idle_minutes = state
        .system_config
        .get(SystemConfigKey::IdleTimeoutMinutes)
        .await?;
    let cutoff = (time::now() - ChronoDuration::minutes(idle_minutes)).to_rfc3339();
    let workspaces = state.orchestrator.store().idle_running_cloud(&cutoff).await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

async fn quota_exceeded_workspaces(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = state
        .system_config
        .get(SystemConfigKey::FreeTierDailyMinutes)
        .await?;
    let users = state.orchestrator.usage().users_over_daily_limit(limit).await?;
    let workspaces = state
        .orchestrator
        .store()
        .running_cloud_for_users(&users)
        .await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InternalStopBody {
    #[serde(default)]
    stop_source: Option<String>,
}

async fn stop_workspace_internal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InternalStopBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = match body.stop_source.as_deref() {
        Some("idle") => StopSource::Idle,
        Some("quota_exhausted") => StopSource::QuotaExhausted,
        Some("error") => StopSource::Error,
        _ => StopSource::Manual,
    };
    let ws = state.orchestrator.stop_internal(&id, source).await?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn terminate_workspace_internal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .terminate_internal(&id, StopSource::Manual)
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn update_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.store().touch_last_active(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Fork the workspace's repository under its owner's integration. Capped per
/// owner so a misbehaving agent cannot spray forks.
async fn fork_repository(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| Error::not_found("workspace not found"))?;
    state
        .throttle
        .check(&ws.user_id, crate::throttle::ThrottleScope::Fork)?;

    let fork = state.orchestrator.fork_repository(&id).await?;
    Ok(Json(json!({ "fork": fork })))
}

/// The compute provider's "deployment is live" webhook.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployWebhookBody {
    service_id: String,
    deployment_id: String,
    status: String,
}

async fn deploy_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeployWebhookBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.status != "deployed" {
        return Ok(Json(json!({ "ignored": true })));
    }
    let ws = state
        .orchestrator
        .store()
        .find_active_by_external_instance(&body.service_id)
        .await?
        .ok_or_else(|| Error::not_found("workspace not found"))?;
    let ws = state
        .orchestrator
        .mark_deployed(&ws.id, &body.deployment_id)
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

/// GitHub app installation events, relayed by the webhook ingress after HMAC
/// verification. Binds the installing user to the installation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitHubInstallationBody {
    email: String,
    installation_id: String,
    account_login: String,
}

async fn github_installation_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GitHubInstallationBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .identity
        .user_by_email(&body.email)
        .await?
        .ok_or_else(|| Error::not_found("user not found"))?;
    let id = state
        .identity
        .add_git_integration(&user.id, "github", &body.installation_id, &body.account_login)
        .await?;
    Ok(Json(json!({ "gitIntegrationId": id })))
}

// ── Workspace-authenticated heartbeat ────────────────────────────────────────

pub fn workspace_router() -> Router<Arc<AppState>> {
    Router::new().route("/heartbeat", post(heartbeat))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    workspace_id: String,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    parts: Parts,
    Json(body): Json<HeartbeatBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let token =
        bearer_token(&parts).ok_or_else(|| Error::auth_required("missing workspace token"))?;
    let claims = state.keys.verify_workspace(&token)?;
    let plan = state
        .identity
        .user(&claims.user_id)
        .await?
        .map(|u| u.plan)
        .unwrap_or(berth_common::types::Plan::Free);

    let response = state
        .orchestrator
        .heartbeat(&claims, &body.workspace_id, plan)
        .await?;
    Ok(Json(serde_json::to_value(response).map_err(Error::other)?))
}

// ── Sandbox executor callback ────────────────────────────────────────────────

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/trpc/agentLoop.handleWebhook", post(agent_loop_callback))
}

async fn agent_loop_callback(
    State(state): State<Arc<AppState>>,
    parts: Parts,
    Json(body): Json<CallbackParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let presented = parts
        .headers
        .get("x-callback-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::auth_required("missing callback secret"))?;

    let current = state.config.secrets.callback_secret.as_str();
    let previous = state.config.secrets.callback_secret_previous.as_deref();
    let accepted =
        !current.is_empty() && (presented == current || Some(presented) == previous);
    if !accepted {
        return Err(Error::auth_required("invalid callback secret").into());
    }

    state.scheduler.process_callback(body).await?;
    Ok(Json(json!({ "ok": true })))
}
