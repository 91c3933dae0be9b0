//! HTTP client side of the device-code login and token redemption.

use {
    serde::Deserialize,
    tracing::debug,
};

use berth_common::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct StartedLogin {
    pub device_code: String,
    pub user_code: String,
    pub interval: u64,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Talks to the control plane's device-login and token-mint endpoints.
pub struct LoginClient {
    http: reqwest::Client,
    api_base: String,
}

impl LoginClient {
    #[must_use]
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Open a device-login session. The caller shows `user_code` to the user.
    pub async fn start(&self) -> Result<StartedLogin> {
        let resp = self
            .http
            .post(format!("{}/tunnel/device/start", self.api_base))
            .send()
            .await
            .map_err(|e| Error::upstream(format!("device login start failed: {e}")))?;
        resp.json()
            .await
            .map_err(|e| Error::upstream(format!("malformed start response: {e}")))
    }

    /// Poll until the user settles the login, sleeping the server-dictated
    /// interval (at least five seconds in production) between attempts.
    /// Returns the agent token.
    pub async fn poll_until_token(&self, login: &StartedLogin) -> Result<String> {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(login.interval)).await;

            let resp: PollResponse = self
                .http
                .post(format!("{}/tunnel/device/poll", self.api_base))
                .json(&serde_json::json!({ "deviceCode": login.device_code }))
                .send()
                .await
                .map_err(|e| Error::upstream(format!("device login poll failed: {e}")))?
                .json()
                .await
                .map_err(|e| Error::upstream(format!("malformed poll response: {e}")))?;

            debug!(status = %resp.status, "device login poll");
            match resp.status.as_str() {
                "pending" => continue,
                "approved" => return self.exchange(&login.device_code).await,
                "denied" => return Err(Error::forbidden("login denied")),
                "expired" => return Err(Error::bad_request("login expired")),
                other => return Err(Error::upstream(format!("unexpected status: {other}"))),
            }
        }
    }

    async fn exchange(&self, device_code: &str) -> Result<String> {
        let resp: TokenResponse = self
            .http
            .post(format!("{}/tunnel/device/exchange", self.api_base))
            .json(&serde_json::json!({ "deviceCode": device_code }))
            .send()
            .await
            .map_err(|e| Error::upstream(format!("device login exchange failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed exchange response: {e}")))?;
        Ok(resp.token)
    }

    /// Redeem a long-lived agent token for a fresh tunnel token.
    pub async fn mint_tunnel_token(&self, agent_token: &str, workspace_id: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/tunnel/token", self.api_base))
            .bearer_auth(agent_token)
            .json(&serde_json::json!({ "workspaceId": workspace_id }))
            .send()
            .await
            .map_err(|e| Error::upstream(format!("tunnel token mint failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::upstream(format!(
                "tunnel token mint rejected: {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed token response: {e}")))?;
        Ok(body.token)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    async fn start_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn start_poll_exchange_flow() {
        let polls = Arc::new(AtomicUsize::new(0));
        let poll_counter = Arc::clone(&polls);
        let app = Router::new()
            .route(
                "/tunnel/device/start",
                post(|| async {
                    Json(serde_json::json!({
                        "device_code": "dc-1",
                        "user_code": "ABCD-1234",
                        "interval": 0,
                        "expires_in": 600
                    }))
                }),
            )
            .route(
                "/tunnel/device/poll",
                post(move |Json(body): Json<serde_json::Value>| {
                    let poll_counter = Arc::clone(&poll_counter);
                    async move {
                        assert_eq!(body["deviceCode"], "dc-1");
                        if poll_counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Json(serde_json::json!({"status": "pending"}))
                        } else {
                            Json(serde_json::json!({"status": "approved"}))
                        }
                    }
                }),
            )
            .route(
                "/tunnel/device/exchange",
                post(|| async { Json(serde_json::json!({"token": "agent-token-1"})) }),
            );
        let base = start_mock(app).await;

        let client = LoginClient::new(base);
        let mut login = client.start().await.unwrap();
        assert_eq!(login.user_code, "ABCD-1234");
        // Shrink the interval so this test does not sleep for real.
        login.interval = 0;

        let token = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            client.poll_until_token(&login),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(token, "agent-token-1");
        assert!(polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn denied_login_errors() {
        let app = Router::new().route(
            "/tunnel/device/poll",
            post(|| async { Json(serde_json::json!({"status": "denied"})) }),
        );
        let base = start_mock(app).await;

        let client = LoginClient::new(base);
        let login = StartedLogin {
            device_code: "dc-1".into(),
            user_code: "X".into(),
            interval: 0,
            expires_in: 600,
        };
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            client.poll_until_token(&login),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::Forbidden);
    }
}
