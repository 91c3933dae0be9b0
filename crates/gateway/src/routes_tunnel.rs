//! Tunnel endpoints: the WebSocket upgrade, device-code login, agent-token
//! redemption, and the public subdomain proxy.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    axum::{
        Json, Router,
        body::Bytes,
        extract::{Query, State, WebSocketUpgrade},
        http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
        response::{IntoResponse, Response},
        routing::post,
    },
    serde::Deserialize,
    serde_json::json,
    tracing::warn,
};

use berth_common::{Error, types::HostingType};
use berth_protocol::frames::ExposedPort;
use berth_tunnel::{ForwardError, TunnelCallbacks, forward_request, parse_host};

use crate::{
    error::ApiResult,
    state::AppState,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", axum::routing::get(tunnel_upgrade))
        .route("/tunnel/device/start", post(device_start))
        .route("/tunnel/device/poll", post(device_poll))
        .route("/tunnel/device/exchange", post(device_exchange))
        .route("/tunnel/token", post(mint_with_agent_token))
}

// ── WebSocket upgrade ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

/// `GET /ws?token=…` — upgrade when the tunnel JWT verifies. The token is
/// re-verified inside the connection handler; this check keeps bad tokens
/// from holding sockets open.
async fn tunnel_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if state.keys.verify_tunnel(&query.token).is_err() {
        return (StatusCode::UNAUTHORIZED, "invalid tunnel token").into_response();
    }

    let sessions = Arc::clone(&state.tunnels);
    let keys = state.keys.clone();
    let callbacks: Arc<dyn TunnelCallbacks> = Arc::new(OrchestratorCallbacks {
        state: Arc::clone(&state),
    });
    upgrade.on_upgrade(move |socket| async move {
        berth_tunnel::handle_connection(socket, sessions, keys, callbacks).await;
    })
}

/// Bridges tunnel lifecycle into workspace state.
struct OrchestratorCallbacks {
    state: Arc<AppState>,
}

#[async_trait]
impl TunnelCallbacks for OrchestratorCallbacks {
    async fn ports_announced(
        &self,
        workspace_id: &str,
        local_port: Option<u16>,
        exposed_ports: &HashMap<String, ExposedPort>,
    ) {
        if let Err(e) = self
            .state
            .orchestrator
            .tunnel_connected(workspace_id, local_port, exposed_ports)
            .await
        {
            warn!(workspace_id, error = %e, "port announcement rejected");
        }
    }

    async fn disconnected(&self, workspace_id: &str) {
        // Liveness reverts to heartbeat/idle accounting; nothing to tear down.
        let _ = self
            .state
            .orchestrator
            .store()
            .touch_last_active(workspace_id)
            .await;
    }
}

// ── Device-code login ────────────────────────────────────────────────────────

async fn device_start(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let login = state.device_login.start().await?;
    Ok(Json(serde_json::to_value(login).map_err(Error::other)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCodeBody {
    device_code: String,
}

async fn device_poll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeviceCodeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.device_login.poll(&body.device_code).await?;
    Ok(Json(json!({ "status": status })))
}

async fn device_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeviceCodeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = state
        .device_login
        .exchange(&body.device_code, &state.keys)
        .await?;
    Ok(Json(json!({ "token": token })))
}

// ── Agent-token redemption ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintBody {
    workspace_id: String,
}

/// Redeem a long-lived agent token for a short-lived tunnel token.
async fn mint_with_agent_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MintBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::auth_required("missing agent token"))?;
    let claims = state.keys.verify_agent(token)?;

    let tunnel_token = state
        .orchestrator
        .mint_tunnel_token(&body.workspace_id, &claims.user_id)
        .await?;
    Ok(Json(json!({ "token": tunnel_token })))
}

// ── Public subdomain proxy ───────────────────────────────────────────────────

/// Fallback handler: any request whose Host is `<subdomain>.<base_domain>`
/// is forwarded through the owning workspace's tunnel.
pub async fn subdomain_proxy(
    State(state): State<Arc<AppState>>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(host) = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let Some((subdomain, service)) = parse_host(host, &state.config.server.base_domain) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let workspace = match state
        .orchestrator
        .store()
        .find_active_by_subdomain(&subdomain)
        .await
    {
        Ok(Some(ws)) => ws,
        Ok(None) => return (StatusCode::NOT_FOUND, "no such workspace").into_response(),
        Err(e) => {
            warn!(error = %e, "subdomain lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        },
    };
    if workspace.hosting_type != HostingType::Local {
        // Cloud workspaces are fronted by the provider's own router.
        return (StatusCode::NOT_FOUND, "no such workspace").into_response();
    }

    let Some(handle) = state.tunnels.get_by_subdomain(&subdomain) else {
        return (StatusCode::BAD_GATEWAY, "tunnel not connected").into_response();
    };

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    match forward_request(&handle, &service, method.as_str(), &path, header_map, &body).await {
        Ok(forwarded) => {
            let mut response = Response::builder().status(forwarded.status);
            if let Some(headers) = response.headers_mut() {
                for (name, value) in &forwarded.headers {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<HeaderName>(),
                        HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }
            response
                .body(axum::body::Body::from(forwarded.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        },
        Err(ForwardError::PortNotPermitted) => {
            (StatusCode::FORBIDDEN, "service not exposed").into_response()
        },
        Err(ForwardError::NoTunnel) => {
            (StatusCode::BAD_GATEWAY, "tunnel not connected").into_response()
        },
        Err(ForwardError::Exchange(message)) => {
            warn!(message = %message, "tunnel exchange failed");
            (StatusCode::BAD_GATEWAY, "tunnel exchange failed").into_response()
        },
    }
}
