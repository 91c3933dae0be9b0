//! WebSocket connection lifecycle for tunnel agents:
//! auth handshake → framed message loop with keepalive → cleanup.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use berth_common::ids::new_id;
use berth_protocol::{
    AUTH_TIMEOUT_MS, MAX_FRAME_BYTES, PING_INTERVAL_MS, PONG_DEADLINE_MS, TokenKeys, TunnelFrame,
    frames::ExposedPort,
};

use crate::session::{TunnelHandle, TunnelSessions};

/// What the broker tells the control plane about an attached tunnel.
#[async_trait]
pub trait TunnelCallbacks: Send + Sync {
    /// Port announcement arrived; the workspace should move to running and
    /// record the ports.
    async fn ports_announced(
        &self,
        workspace_id: &str,
        local_port: Option<u16>,
        exposed_ports: &HashMap<String, ExposedPort>,
    );

    /// The connection is gone (including missed-pong terminations).
    async fn disconnected(&self, workspace_id: &str);
}

/// Handle a single tunnel WebSocket through its full lifecycle.
pub async fn handle_connection(
    socket: WebSocket,
    sessions: Arc<TunnelSessions>,
    keys: TokenKeys,
    callbacks: Arc<dyn TunnelCallbacks>,
) {
    let conn_id = new_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<TunnelFrame>();

    // Write loop: serializes frames toward the agent.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "tunnel write loop closed");
                break;
            }
        }
    });

    // ── Auth handshake ───────────────────────────────────────────────────

    let claims = match tokio::time::timeout(
        Duration::from_millis(AUTH_TIMEOUT_MS),
        wait_for_auth(&mut ws_rx, &keys),
    )
    .await
    {
        Ok(Ok(claims)) => claims,
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "tunnel auth failed");
            let _ = frame_tx.send(TunnelFrame::Error {
                id: None,
                message: "authentication failed".into(),
            });
            drop(frame_tx);
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "tunnel auth timeout");
            drop(frame_tx);
            write_handle.abort();
            return;
        },
    };

    let workspace_id = claims.workspace_id.clone();
    info!(
        conn_id = %conn_id,
        workspace_id = %workspace_id,
        subdomain = %claims.subdomain,
        "tunnel attached"
    );

    let handle = TunnelHandle::new(conn_id.clone(), claims, frame_tx.clone());
    sessions.attach(Arc::clone(&handle));

    // ── Message loop with keepalive ──────────────────────────────────────

    let mut ping_timer = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > Duration::from_millis(PONG_DEADLINE_MS) {
                    warn!(conn_id = %conn_id, "tunnel missed pong deadline");
                    break;
                }
                let timestamp = berth_common::time::now().timestamp_millis() as u64;
                handle.send(TunnelFrame::Ping { timestamp });
            },
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "tunnel read error");
                        break;
                    },
                };

                if text.len() > MAX_FRAME_BYTES {
                    warn!(conn_id = %conn_id, size = text.len(), "tunnel frame too large");
                    handle.send(TunnelFrame::Error {
                        id: None,
                        message: "frame too large".into(),
                    });
                    continue;
                }

                let frame: TunnelFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(conn_id = %conn_id, error = %e, "malformed tunnel frame dropped");
                        continue;
                    },
                };

                match frame {
                    TunnelFrame::Pong { .. } => {
                        last_pong = Instant::now();
                    },
                    TunnelFrame::Ping { timestamp } => {
                        handle.send(TunnelFrame::Pong { timestamp });
                    },
                    TunnelFrame::Open { port, exposed_ports } => {
                        callbacks
                            .ports_announced(
                                &workspace_id,
                                port,
                                &exposed_ports.unwrap_or_default(),
                            )
                            .await;
                    },
                    TunnelFrame::Response { ref id, .. } => {
                        let id = id.clone();
                        handle.route(&id, frame);
                    },
                    TunnelFrame::Data { ref id, .. } => {
                        let id = id.clone();
                        handle.route(&id, frame);
                    },
                    TunnelFrame::Error { id: Some(ref id), .. } => {
                        let id = id.clone();
                        handle.route(&id, frame);
                    },
                    TunnelFrame::Error { id: None, message } => {
                        warn!(conn_id = %conn_id, message = %message, "tunnel error from agent");
                    },
                    TunnelFrame::Auth { .. }
                    | TunnelFrame::Close { .. }
                    | TunnelFrame::Request { .. } => {
                        debug!(conn_id = %conn_id, "unexpected frame direction, dropped");
                    },
                    TunnelFrame::Unknown => {
                        // Forward compatibility: drop without closing.
                        debug!(conn_id = %conn_id, "unknown frame type dropped");
                    },
                }
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    if sessions.detach(&workspace_id, &conn_id) {
        callbacks.disconnected(&workspace_id).await;
    }
    info!(conn_id = %conn_id, workspace_id = %workspace_id, "tunnel detached");
    drop(frame_tx);
    write_handle.abort();
}

/// Wait for the initial `auth` frame and verify its token.
async fn wait_for_auth(
    rx: &mut futures::stream::SplitStream<WebSocket>,
    keys: &TokenKeys,
) -> Result<berth_protocol::TunnelClaims, berth_common::Error> {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => {
                return Err(berth_common::Error::auth_required(
                    "connection closed before auth",
                ));
            },
            Ok(_) => continue,
            Err(e) => {
                return Err(berth_common::Error::auth_required(format!(
                    "read failed before auth: {e}"
                )));
            },
        };

        let frame: TunnelFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        return match frame {
            TunnelFrame::Auth { token, .. } => keys.verify_tunnel(&token),
            _ => Err(berth_common::Error::auth_required(
                "first frame must be auth",
            )),
        };
    }
    Err(berth_common::Error::auth_required(
        "connection closed before auth",
    ))
}
