//! Session-protected RPC: workspace CRUD, agent-loop CRUD, credentials,
//! device-login approval, and the status-event stream.

use std::{collections::HashMap, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{Path, State},
        response::sse::{Event, Sse},
        routing::{delete, get, post},
    },
    futures::StreamExt,
    serde::Deserialize,
    serde_json::json,
    tokio_stream::wrappers::BroadcastStream,
};

use berth_loops::NewLoopParams;
use berth_workspaces::CreateWorkspaceParams;

use crate::{
    error::ApiResult,
    state::{AppState, AuthedUser},
    throttle::ThrottleScope,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workspaces", post(create_workspace).get(list_workspaces))
        .route("/workspaces/{id}/stop", post(stop_workspace))
        .route("/workspaces/{id}/restart", post(restart_workspace))
        .route("/workspaces/{id}", delete(delete_workspace))
        .route("/workspaces/{id}/rename", post(rename_workspace))
        .route("/workspaces/{id}/tunnel-token", post(mint_tunnel_token))
        .route("/loops", post(create_loop).get(list_loops))
        .route("/loops/{id}/runs", get(list_runs))
        .route("/loops/{id}/start", post(start_run))
        .route("/loops/{id}/pause", post(pause_loop))
        .route("/loops/{id}/resume", post(resume_loop))
        .route("/loops/{id}/archive", post(archive_loop))
        .route("/loops/{id}/complete", post(complete_loop))
        .route("/loops/{id}", delete(delete_loop))
        .route("/runs/{id}/restart", post(restart_run))
        .route("/credentials", post(store_api_key).get(list_credentials))
        .route("/credentials/{id}/revoke", post(revoke_credential))
        .route("/credentials/{id}", delete(delete_credential))
        .route("/credentials/oauth/start", post(oauth_start))
        .route("/credentials/oauth/poll", post(oauth_poll))
        .route("/device/approve", post(approve_device))
        .route("/device/deny", post(deny_device))
        .route("/events", get(event_stream))
}

// ── Workspaces ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceBody {
    name: Option<String>,
    agent_type_id: String,
    cloud_provider_id: String,
    region_id: String,
    repository_url: Option<String>,
    git_integration_id: Option<String>,
    #[serde(default)]
    persistent: bool,
    subdomain: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

async fn create_workspace(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<CreateWorkspaceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.throttle.check(&user.id, ThrottleScope::WorkspaceCreate)?;
    let ws = state
        .orchestrator
        .create_workspace(&user.context(), CreateWorkspaceParams {
            name: body.name,
            agent_type_id: body.agent_type_id,
            cloud_provider_id: body.cloud_provider_id,
            region_id: body.region_id,
            repository_url: body.repository_url,
            git_integration_id: body.git_integration_id,
            persistent: body.persistent,
            subdomain: body.subdomain,
            extra_env: body.env,
        })
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn list_workspaces(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> ApiResult<Json<serde_json::Value>> {
    let workspaces = state.orchestrator.store().list_for_user(&user.id).await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

async fn stop_workspace(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .stop_workspace(&id, &user.context())
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn restart_workspace(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .restart_workspace(&id, &user.context())
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let ws = state
        .orchestrator
        .delete_workspace(&id, &user.context())
        .await?;
    Ok(Json(json!({ "workspace": ws })))
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

async fn rename_workspace(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.name.trim().is_empty() {
        return Err(berth_common::Error::bad_request("name must not be empty").into());
    }
    state.orchestrator.store().get_owned(&id, &user.id).await?;
    state.orchestrator.store().rename(&id, body.name.trim()).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn mint_tunnel_token(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = state.orchestrator.mint_tunnel_token(&id, &user.id).await?;
    Ok(Json(json!({ "token": token })))
}

// ── Agent loops ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLoopBody {
    git_integration_id: String,
    sandbox_provider_id: String,
    repository_owner: String,
    repository_name: String,
    branch: String,
    plan_file_path: String,
    progress_file_path: Option<String>,
    model_provider_id: String,
    model_id: String,
    credential_id: Option<String>,
    #[serde(default)]
    automation_enabled: bool,
    max_runs: i64,
    prompt: Option<String>,
}

async fn create_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<CreateLoopBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.throttle.check(&user.id, ThrottleScope::LoopCreate)?;
    let lp = state
        .scheduler
        .create_loop(&user.id, user.plan, NewLoopParams {
            git_integration_id: body.git_integration_id,
            sandbox_provider_id: body.sandbox_provider_id,
            repository_owner: body.repository_owner,
            repository_name: body.repository_name,
            branch: body.branch,
            plan_file_path: body.plan_file_path,
            progress_file_path: body.progress_file_path,
            model_provider_id: body.model_provider_id,
            model_id: body.model_id,
            credential_id: body.credential_id,
            automation_enabled: body.automation_enabled,
            max_runs: body.max_runs,
            prompt: body.prompt,
        })
        .await?;
    Ok(Json(json!({ "loop": lp })))
}

async fn list_loops(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> ApiResult<Json<serde_json::Value>> {
    let loops = state.scheduler.store().list_for_user(&user.id).await?;
    Ok(Json(json!({ "loops": loops })))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.store().get_owned(&id, &user.id).await?;
    let runs = state.scheduler.store().runs_for_loop(&id).await?;
    Ok(Json(json!({ "runs": runs })))
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.throttle.check(&user.id, ThrottleScope::RunStart)?;
    let run = state.scheduler.start_run(&id, &user.id, user.plan).await?;
    Ok(Json(json!({ "run": run })))
}

async fn restart_run(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = state.scheduler.restart_run(&id, &user.id, user.plan).await?;
    Ok(Json(json!({ "run": run })))
}

async fn pause_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.pause_loop(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn resume_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.resume_loop(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn archive_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.archive_loop(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn complete_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.complete_loop(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_loop(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.delete_loop(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Credentials ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreApiKeyBody {
    provider: String,
    api_key: String,
    label: Option<String>,
}

async fn store_api_key(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<StoreApiKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = state
        .vault
        .store_api_key(&user.id, &body.provider, &body.api_key, body.label.as_deref())
        .await?;
    Ok(Json(json!({ "credentialId": id })))
}

async fn list_credentials(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> ApiResult<Json<serde_json::Value>> {
    let credentials = state.vault.list_credentials(&user.id).await?;
    Ok(Json(json!({ "credentials": credentials })))
}

async fn revoke_credential(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.vault.revoke_credential(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_credential(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.vault.delete_credential(&id, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct OAuthStartBody {
    provider: String,
}

async fn oauth_start(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<OAuthStartBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let flow = state
        .oauth_flows
        .initiate(&state.vault, &user.id, &body.provider)
        .await?;
    Ok(Json(json!({ "flow": flow })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthPollBody {
    flow_id: String,
}

async fn oauth_poll(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<OAuthPollBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .oauth_flows
        .poll(&state.vault, &user.id, &body.flow_id)
        .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(berth_common::Error::other)?))
}

// ── Device login approval ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCodeBody {
    user_code: String,
}

async fn approve_device(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<DeviceCodeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.device_login.approve(&body.user_code, &user.id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn deny_device(
    State(state): State<Arc<AppState>>,
    AuthedUser(_user): AuthedUser,
    Json(body): Json<DeviceCodeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.device_login.deny(&body.user_code).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Status events ────────────────────────────────────────────────────────────

/// Server-sent stream of workspace and run status events scoped to the
/// caller. Lagging subscribers drop events rather than blocking emitters.
async fn event_stream(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let user_id = user.id;
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |event| {
        let user_id = user_id.clone();
        async move {
            let event = event.ok()?;
            let owner = match &event {
                berth_protocol::ControlEvent::WorkspaceStatus(e) => &e.user_id,
                berth_protocol::ControlEvent::RunStatus(e) => &e.user_id,
            };
            if *owner != user_id {
                return None;
            }
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().data(json)))
        }
    });
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}
