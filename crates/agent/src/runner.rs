//! The agent's connection loop: auth, port announcement, request handling,
//! and supervised reconnect with backoff.

use std::{collections::HashMap, time::Duration};

use {
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::protocol::Message},
    tracing::{debug, info, warn},
};

use berth_common::{Error, Result};
use berth_protocol::{DATA_CHUNK_BYTES, TunnelFrame, frames::ExposedPort};

/// Outgoing frame buffer; when the broker cannot keep up, the connection is
/// torn down and re-established rather than buffering without bound.
const FRAME_BUFFER: usize = 256;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `ws(s)://…/ws` endpoint of the broker.
    pub ws_url: String,
    /// Tunnel JWT presented in the auth frame.
    pub token: String,
    /// Host local services listen on.
    pub local_host: String,
    /// The root service's port.
    pub local_port: u16,
    /// Named services to expose.
    pub exposed_ports: HashMap<String, ExposedPort>,
}

struct InFlight {
    body_tx: mpsc::UnboundedSender<(Vec<u8>, bool)>,
    task: tokio::task::JoinHandle<()>,
}

pub struct TunnelAgent {
    config: AgentConfig,
    http: reqwest::Client,
}

impl TunnelAgent {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Run forever, reconnecting with exponential backoff.
    pub async fn run(&self) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.run_connection().await {
                Ok(()) => {
                    info!("tunnel connection closed, reconnecting");
                    backoff = BACKOFF_INITIAL;
                },
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "tunnel connection failed");
                },
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// One connection lifecycle. Returns `Ok` on orderly close.
    pub async fn run_connection(&self) -> Result<()> {
        let (socket, _) = connect_async(&self.config.ws_url)
            .await
            .map_err(|e| Error::upstream(format!("tunnel connect failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<TunnelFrame>(FRAME_BUFFER);

        let write_handle = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        // Handshake: auth, then announce ports so the workspace goes running.
        frame_tx
            .send(TunnelFrame::Auth {
                token: self.config.token.clone(),
                timestamp: Some(berth_common::time::now().timestamp_millis() as u64),
            })
            .await
            .map_err(|_| Error::internal("write loop closed during handshake"))?;
        frame_tx
            .send(TunnelFrame::Open {
                port: Some(self.config.local_port),
                exposed_ports: Some(self.config.exposed_ports.clone()),
            })
            .await
            .map_err(|_| Error::internal("write loop closed during handshake"))?;

        info!(url = %self.config.ws_url, "tunnel agent connected");

        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        let result = loop {
            let Some(msg) = ws_rx.next().await else {
                break Ok(());
            };
            let text = match msg {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Close(_)) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(Error::upstream(format!("tunnel read failed: {e}"))),
            };

            let frame: TunnelFrame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "malformed frame from broker dropped");
                    continue;
                },
            };

            match frame {
                TunnelFrame::Ping { timestamp } => {
                    if frame_tx.send(TunnelFrame::Pong { timestamp }).await.is_err() {
                        break Ok(());
                    }
                },
                TunnelFrame::Request {
                    id,
                    method,
                    path,
                    headers,
                    port,
                } => {
                    let (body_tx, body_rx) = mpsc::unbounded_channel();
                    let task = tokio::spawn(handle_request(
                        self.http.clone(),
                        frame_tx.clone(),
                        RequestContext {
                            id: id.clone(),
                            method,
                            path,
                            headers,
                            base_url: format!("http://{}:{port}", self.config.local_host),
                        },
                        body_rx,
                    ));
                    in_flight.insert(id, InFlight { body_tx, task });
                },
                TunnelFrame::Data { ref id, ref is_final, .. } => {
                    let is_final = *is_final;
                    let bytes = frame.data_bytes();
                    let id = id.clone();
                    if let Some(entry) = in_flight.get(&id) {
                        let _ = entry.body_tx.send((bytes, is_final));
                    }
                },
                TunnelFrame::Close { id } => {
                    // The viewer went away; abort the upstream fetch.
                    if let Some(entry) = in_flight.remove(&id) {
                        entry.task.abort();
                        debug!(id, "exchange cancelled by broker");
                    }
                },
                TunnelFrame::Error { id, message } => {
                    warn!(id = id.as_deref().unwrap_or("-"), message = %message, "broker error");
                },
                TunnelFrame::Unknown => {
                    debug!("unknown frame type dropped");
                },
                TunnelFrame::Auth { .. }
                | TunnelFrame::Open { .. }
                | TunnelFrame::Response { .. }
                | TunnelFrame::Pong { .. } => {
                    debug!("unexpected frame direction, dropped");
                },
            }

            in_flight.retain(|_, entry| !entry.task.is_finished());
        };

        // Disconnect cancels all in-flight work.
        for (_, entry) in in_flight.drain() {
            entry.task.abort();
        }
        drop(frame_tx);
        write_handle.abort();
        result
    }
}

struct RequestContext {
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    base_url: String,
}

/// Collect the request body, perform the upstream fetch, and stream back the
/// response. Upstream failures become a 502 with a JSON error body.
async fn handle_request(
    http: reqwest::Client,
    frame_tx: mpsc::Sender<TunnelFrame>,
    ctx: RequestContext,
    mut body_rx: mpsc::UnboundedReceiver<(Vec<u8>, bool)>,
) {
    let mut body = Vec::new();
    while let Some((chunk, is_final)) = body_rx.recv().await {
        body.extend_from_slice(&chunk);
        if is_final {
            break;
        }
    }

    let url = format!("{}{}", ctx.base_url, ctx.path);
    let method = reqwest::Method::from_bytes(ctx.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut request = http.request(method, &url);
    for (name, value) in &ctx.headers {
        // Hop-by-hop headers stay on their own leg.
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let _ = frame_tx
                .send(TunnelFrame::Response {
                    id: ctx.id.clone(),
                    status_code: status,
                    headers,
                })
                .await;

            let bytes = response.bytes().await.unwrap_or_default();
            if bytes.is_empty() {
                let _ = frame_tx.send(TunnelFrame::data(&ctx.id, b"", true)).await;
            } else {
                let chunks: Vec<&[u8]> = bytes.chunks(DATA_CHUNK_BYTES).collect();
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    if frame_tx
                        .send(TunnelFrame::data(&ctx.id, chunk, i == last))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        },
        Err(e) => {
            debug!(id = %ctx.id, error = %e, "upstream fetch failed");
            let _ = frame_tx
                .send(TunnelFrame::Response {
                    id: ctx.id.clone(),
                    status_code: 502,
                    headers: HashMap::from([(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )]),
                })
                .await;
            let body = serde_json::json!({ "error": "upstream unreachable" }).to_string();
            let _ = frame_tx
                .send(TunnelFrame::data(&ctx.id, body.as_bytes(), true))
                .await;
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_handler_round_trips_local_service() {
        // Local upstream the agent will fetch from.
        let app = axum::Router::new().route(
            "/hello",
            axum::routing::get(|| async { ([("x-upstream", "yes")], "hi from local") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        body_tx.send((Vec::new(), true)).unwrap();

        handle_request(
            reqwest::Client::new(),
            frame_tx,
            RequestContext {
                id: "r1".into(),
                method: "GET".into(),
                path: "/hello".into(),
                headers: HashMap::new(),
                base_url: format!("http://{addr}"),
            },
            body_rx,
        )
        .await;

        let response = frame_rx.recv().await.unwrap();
        let TunnelFrame::Response {
            status_code,
            headers,
            ..
        } = response
        else {
            panic!("expected response frame");
        };
        assert_eq!(status_code, 200);
        assert_eq!(headers.get("x-upstream").map(String::as_str), Some("yes"));

        let data = frame_rx.recv().await.unwrap();
        assert_eq!(data.data_bytes(), b"hi from local");
        assert!(matches!(data, TunnelFrame::Data { is_final: true, .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_becomes_502() {
        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        body_tx.send((Vec::new(), true)).unwrap();

        handle_request(
            reqwest::Client::new(),
            frame_tx,
            RequestContext {
                id: "r1".into(),
                method: "GET".into(),
                path: "/".into(),
                headers: HashMap::new(),
                // Reserved port with nothing listening.
                base_url: "http://127.0.0.1:9".into(),
            },
            body_rx,
        )
        .await;

        let TunnelFrame::Response { status_code, .. } = frame_rx.recv().await.unwrap() else {
            panic!("expected response frame");
        };
        assert_eq!(status_code, 502);
        let body = frame_rx.recv().await.unwrap();
        assert!(String::from_utf8(body.data_bytes()).unwrap().contains("error"));
    }

    #[tokio::test]
    async fn request_body_is_forwarded() {
        let app = axum::Router::new().route(
            "/echo",
            axum::routing::post(|body: String| async move { body.to_uppercase() }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        // Two chunks, final on the second.
        body_tx.send((b"hello ".to_vec(), false)).unwrap();
        body_tx.send((b"tunnel".to_vec(), true)).unwrap();

        handle_request(
            reqwest::Client::new(),
            frame_tx,
            RequestContext {
                id: "r1".into(),
                method: "POST".into(),
                path: "/echo".into(),
                headers: HashMap::new(),
                base_url: format!("http://{addr}"),
            },
            body_rx,
        )
        .await;

        let TunnelFrame::Response { status_code, .. } = frame_rx.recv().await.unwrap() else {
            panic!("expected response frame");
        };
        assert_eq!(status_code, 200);
        let data = frame_rx.recv().await.unwrap();
        assert_eq!(data.data_bytes(), b"HELLO TUNNEL");
    }
}
