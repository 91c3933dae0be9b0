//! Map one inbound HTTP request onto the tunnel's framed protocol.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::debug;

use berth_common::ids::new_id;
use berth_protocol::{DATA_CHUNK_BYTES, TunnelFrame};

use crate::session::TunnelHandle;

/// How long the broker waits for the agent to finish one exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwarding failures, mapped to HTTP statuses by the proxy layer.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// No live tunnel for the subdomain.
    #[error("no tunnel attached")]
    NoTunnel,
    /// The service name is not in the token's exposed-ports map.
    #[error("service not exposed")]
    PortNotPermitted,
    /// The agent disappeared or timed out mid-exchange.
    #[error("tunnel exchange failed: {0}")]
    Exchange(String),
}

#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Split `host` into (subdomain, service name) relative to the base domain.
///
/// `demo.base.dev` → `("demo", "root")`; `api.demo.base.dev` → `("demo", "api")`.
#[must_use]
pub fn parse_host(host: &str, base_domain: &str) -> Option<(String, String)> {
    let host = host.split(':').next().unwrap_or(host);
    let prefix = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    let mut labels: Vec<&str> = prefix.split('.').collect();
    let subdomain = labels.pop()?;
    if subdomain.is_empty() {
        return None;
    }
    let service = match labels.len() {
        0 => "root",
        1 => labels[0],
        _ => return None,
    };
    if service.is_empty() {
        return None;
    }
    Some((subdomain.to_string(), service.to_string()))
}

/// Forward one request through an attached tunnel and collect the response.
///
/// Frames within the exchange id are ordered; dropping this future sends a
/// `close` frame so the agent can abort its upstream fetch.
pub async fn forward_request(
    handle: &Arc<TunnelHandle>,
    service: &str,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: &[u8],
) -> Result<ForwardedResponse, ForwardError> {
    let port = handle
        .claims
        .exposed_ports
        .get(service)
        .map(|p| p.port)
        .ok_or(ForwardError::PortNotPermitted)?;

    let id = new_id();
    let mut exchange = handle.register_exchange(&id);
    // Cancellation guard: tells the agent to abort if we stop waiting.
    let guard = CloseGuard {
        handle: Arc::clone(handle),
        id: id.clone(),
        armed: true,
    };

    let sent = handle.send(TunnelFrame::Request {
        id: id.clone(),
        method: method.to_string(),
        path: path.to_string(),
        headers,
        port,
    });
    if !sent {
        return Err(ForwardError::NoTunnel);
    }

    if body.is_empty() {
        handle.send(TunnelFrame::data(&id, b"", true));
    } else {
        let chunks: Vec<&[u8]> = body.chunks(DATA_CHUNK_BYTES).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            handle.send(TunnelFrame::data(&id, chunk, i == last));
        }
    }

    let result = tokio::time::timeout(EXCHANGE_TIMEOUT, async {
        let mut status: Option<u16> = None;
        let mut response_headers = HashMap::new();
        let mut response_body = Vec::new();

        while let Some(frame) = exchange.recv().await {
            match frame {
                TunnelFrame::Response {
                    status_code,
                    headers,
                    ..
                } => {
                    status = Some(status_code);
                    response_headers = headers;
                },
                TunnelFrame::Data { ref is_final, .. } => {
                    let is_final = *is_final;
                    response_body.extend_from_slice(&frame.data_bytes());
                    if is_final {
                        let status =
                            status.ok_or_else(|| ForwardError::Exchange("body before response".into()))?;
                        return Ok(ForwardedResponse {
                            status,
                            headers: response_headers,
                            body: response_body,
                        });
                    }
                },
                TunnelFrame::Error { message, .. } => {
                    return Err(ForwardError::Exchange(message));
                },
                other => {
                    debug!(?other, "unexpected frame in exchange, dropped");
                },
            }
        }
        Err(ForwardError::Exchange("tunnel closed mid-exchange".into()))
    })
    .await;

    let mut guard = guard;
    match result {
        Ok(Ok(response)) => {
            guard.armed = false;
            handle.finish_exchange(&id);
            Ok(response)
        },
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ForwardError::Exchange("exchange timed out".into())),
    }
}

struct CloseGuard {
    handle: Arc<TunnelHandle>,
    id: String,
    armed: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.send(TunnelFrame::Close {
                id: self.id.clone(),
            });
            self.handle.finish_exchange(&self.id);
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use berth_protocol::{TunnelClaims, frames::ExposedPort, scopes};
    use tokio::sync::mpsc;

    fn handle_with_ports() -> (Arc<TunnelHandle>, mpsc::UnboundedReceiver<TunnelFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let claims = TunnelClaims {
            workspace_id: "ws-1".into(),
            user_id: "user-1".into(),
            subdomain: "demo".into(),
            exposed_ports: HashMap::from([
                ("root".to_string(), ExposedPort {
                    port: 3000,
                    description: None,
                }),
                ("api".to_string(), ExposedPort {
                    port: 4000,
                    description: None,
                }),
            ]),
            scope: scopes::TUNNEL_CONNECT.into(),
            exp: 0,
        };
        (TunnelHandle::new("c1".into(), claims, tx), rx)
    }

    #[test]
    fn parse_host_variants() {
        let base = "berth.dev";
        assert_eq!(
            parse_host("demo.berth.dev", base),
            Some(("demo".into(), "root".into()))
        );
        assert_eq!(
            parse_host("api.demo.berth.dev", base),
            Some(("demo".into(), "api".into()))
        );
        assert_eq!(
            parse_host("api.demo.berth.dev:8443", base),
            Some(("demo".into(), "api".into()))
        );
        assert_eq!(parse_host("berth.dev", base), None);
        assert_eq!(parse_host("a.b.demo.berth.dev", base), None);
        assert_eq!(parse_host("demo.other.dev", base), None);
    }

    #[tokio::test]
    async fn round_trip_exchange() {
        let (handle, mut agent_rx) = handle_with_ports();

        let handle_clone = Arc::clone(&handle);
        let forward = tokio::spawn(async move {
            forward_request(
                &handle_clone,
                "api",
                "GET",
                "/users",
                HashMap::new(),
                b"",
            )
            .await
        });

        // The agent side sees the request on port 4000 and an empty final body.
        let request = agent_rx.recv().await.unwrap();
        let TunnelFrame::Request { id, port, method, .. } = request else {
            panic!("expected request frame");
        };
        assert_eq!(port, 4000);
        assert_eq!(method, "GET");
        let body = agent_rx.recv().await.unwrap();
        assert!(matches!(body, TunnelFrame::Data { is_final: true, .. }));

        // Reply: response header frame, then one final data chunk.
        handle.route(&id, TunnelFrame::Response {
            id: id.clone(),
            status_code: 200,
            headers: HashMap::from([("content-type".into(), "application/json".into())]),
        });
        handle.route(&id, TunnelFrame::data(&id, b"[{\"id\":1}]", true));

        let response = forward.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"[{\"id\":1}]");
        assert_eq!(response.headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn unknown_service_is_refused() {
        let (handle, _agent_rx) = handle_with_ports();
        let err = forward_request(&handle, "db", "GET", "/", HashMap::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::PortNotPermitted));
    }

    #[tokio::test]
    async fn agent_error_frame_fails_exchange() {
        let (handle, mut agent_rx) = handle_with_ports();

        let handle_clone = Arc::clone(&handle);
        let forward = tokio::spawn(async move {
            forward_request(&handle_clone, "root", "GET", "/", HashMap::new(), b"").await
        });

        let TunnelFrame::Request { id, .. } = agent_rx.recv().await.unwrap() else {
            panic!("expected request frame");
        };
        handle.route(&id, TunnelFrame::Error {
            id: Some(id.clone()),
            message: "upstream refused".into(),
        });

        let err = forward.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Exchange(_)));
    }

    #[tokio::test]
    async fn dropped_forward_sends_close() {
        let (handle, mut agent_rx) = handle_with_ports();

        let handle_clone = Arc::clone(&handle);
        let forward = tokio::spawn(async move {
            forward_request(&handle_clone, "root", "GET", "/slow", HashMap::new(), b"").await
        });

        let TunnelFrame::Request { id, .. } = agent_rx.recv().await.unwrap() else {
            panic!("expected request frame");
        };
        let _ = agent_rx.recv().await.unwrap(); // body terminator

        // Cancel the in-flight exchange.
        forward.abort();
        let _ = forward.await;

        // The agent is told to abort its upstream work.
        let close = agent_rx.recv().await.unwrap();
        assert_eq!(close, TunnelFrame::Close { id });
    }
}
