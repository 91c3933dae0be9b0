//! Device-code flow against upstream model providers.
//!
//! The broker holds flow state in memory and performs exactly one upstream
//! poll per caller request; it never schedules its own timers. `slow_down`
//! responses stretch the interval the caller is told to wait by at least
//! five seconds.

use std::time::{Duration, Instant};

use {
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    tracing::info,
};

use berth_common::ids::new_id;

use crate::{error::VaultError, store::CredentialStore};

/// Upstream flow lifetime guard; providers enforce their own expiry too.
const FLOW_TTL: Duration = Duration::from_secs(15 * 60);
/// Minimum stretch applied on `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenPollResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

/// What `initiate` hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedFlow {
    pub flow_id: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Seconds the caller must wait before the first poll.
    pub interval: u64,
}

/// Result of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    Pending { interval: u64 },
    SlowDown { interval: u64 },
    Success { credential_id: String },
    Error { message: String },
}

struct FlowState {
    user_id: String,
    provider_name: String,
    device_code: String,
    interval: u64,
    started_at: Instant,
}

/// In-memory device-flow sessions keyed by flow id.
pub struct DeviceFlowBroker {
    flows: DashMap<String, FlowState>,
}

impl DeviceFlowBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    /// Request a device code from the provider and open a flow session.
    pub async fn initiate(
        &self,
        store: &CredentialStore,
        user_id: &str,
        provider_name: &str,
    ) -> Result<InitiatedFlow, VaultError> {
        let endpoints = store
            .endpoints_for(provider_name)
            .ok_or_else(|| VaultError::OAuth(format!("no oauth endpoints for {provider_name}")))?
            .clone();

        let resp = store
            .http()
            .post(&endpoints.device_code_url)
            .header("Accept", "application/json")
            .form(&[("client_id", endpoints.client_id.as_str()), ("scope", "")])
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VaultError::OAuth(format!(
                "device code request failed: {body}"
            )));
        }

        let body: DeviceCodeResponse = resp.json().await?;
        let flow_id = new_id();
        self.flows.insert(flow_id.clone(), FlowState {
            user_id: user_id.to_string(),
            provider_name: provider_name.to_string(),
            device_code: body.device_code,
            interval: body.interval,
            started_at: Instant::now(),
        });

        info!(user_id, provider = provider_name, "device flow started");
        Ok(InitiatedFlow {
            flow_id,
            user_code: body.user_code,
            verification_uri: body.verification_uri,
            verification_uri_complete: body.verification_uri_complete,
            interval: body.interval,
        })
    }

    /// Poll the provider's token endpoint once. On success the tokens are
    /// stored and the flow session is consumed.
    pub async fn poll(
        &self,
        store: &CredentialStore,
        user_id: &str,
        flow_id: &str,
    ) -> Result<PollOutcome, VaultError> {
        let (provider_name, device_code, interval) = {
            let flow = self.flows.get(flow_id).ok_or(VaultError::FlowExpired)?;
            if flow.user_id != user_id {
                return Err(VaultError::FlowExpired);
            }
            if flow.started_at.elapsed() > FLOW_TTL {
                drop(flow);
                self.flows.remove(flow_id);
                return Err(VaultError::FlowExpired);
            }
            (
                flow.provider_name.clone(),
                flow.device_code.clone(),
                flow.interval,
            )
        };

        let endpoints = store
            .endpoints_for(&provider_name)
            .ok_or_else(|| VaultError::OAuth(format!("no oauth endpoints for {provider_name}")))?
            .clone();

        let resp = store
            .http()
            .post(&endpoints.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", endpoints.client_id.as_str()),
                ("device_code", device_code.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ])
            .send()
            .await?;

        let body: TokenPollResponse = resp.json().await?;

        if let Some(token) = body.access_token {
            let expires_at = body
                .expires_in
                .map(|secs| berth_common::time::now().timestamp() + secs);
            let refresh = body.refresh_token.unwrap_or_default();
            let credential_id = store
                .store_oauth_tokens(
                    user_id,
                    &provider_name,
                    &refresh,
                    Some(&token),
                    expires_at,
                    None,
                )
                .await?;
            self.flows.remove(flow_id);
            info!(user_id, provider = %provider_name, "device flow completed");
            return Ok(PollOutcome::Success { credential_id });
        }

        match body.error.as_deref() {
            Some("authorization_pending") | None => Ok(PollOutcome::Pending { interval }),
            Some("slow_down") => {
                let stretched = interval + SLOW_DOWN_STEP_SECS;
                if let Some(mut flow) = self.flows.get_mut(flow_id) {
                    flow.interval = stretched;
                }
                Ok(PollOutcome::SlowDown {
                    interval: stretched,
                })
            },
            Some(other) => {
                self.flows.remove(flow_id);
                Ok(PollOutcome::Error {
                    message: other.to_string(),
                })
            },
        }
    }
}

impl Default for DeviceFlowBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cipher::derive_process_key, store::OAuthEndpoints};
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use {
        axum::{Router, routing::post},
        sqlx::SqlitePool,
    };

    /// Start a mock HTTP server and return its base URL.
    async fn start_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn store_with_endpoints(base: &str) -> CredentialStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let endpoints = HashMap::from([("anthropic".to_string(), OAuthEndpoints {
            client_id: "test-client".into(),
            device_code_url: format!("{base}/device/code"),
            token_url: format!("{base}/token"),
        })]);
        CredentialStore::new(pool, derive_process_key("test"), endpoints)
            .await
            .unwrap()
    }

    fn device_code_route() -> Router {
        Router::new().route(
            "/device/code",
            post(|| async {
                axum::Json(serde_json::json!({
                    "device_code": "dc_123",
                    "user_code": "ABCD-1234",
                    "verification_uri": "https://example.com/device",
                    "interval": 5
                }))
            }),
        )
    }

    #[tokio::test]
    async fn initiate_returns_user_code() {
        let base = start_mock(device_code_route()).await;
        let store = store_with_endpoints(&base).await;
        let broker = DeviceFlowBroker::new();

        let flow = broker.initiate(&store, "user-1", "anthropic").await.unwrap();
        assert_eq!(flow.user_code, "ABCD-1234");
        assert_eq!(flow.interval, 5);
    }

    #[tokio::test]
    async fn pending_then_success_stores_tokens() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = device_code_route().route(
            "/token",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        axum::Json(serde_json::json!({"error": "authorization_pending"}))
                    } else {
                        axum::Json(serde_json::json!({
                            "access_token": "at_1",
                            "refresh_token": "rt_1",
                            "expires_in": 3600
                        }))
                    }
                }
            }),
        );
        let base = start_mock(app).await;
        let store = store_with_endpoints(&base).await;
        let broker = DeviceFlowBroker::new();

        let flow = broker.initiate(&store, "user-1", "anthropic").await.unwrap();

        let first = broker.poll(&store, "user-1", &flow.flow_id).await.unwrap();
        assert_eq!(first, PollOutcome::Pending { interval: 5 });

        let second = broker.poll(&store, "user-1", &flow.flow_id).await.unwrap();
        let PollOutcome::Success { credential_id } = second else {
            panic!("expected success, got {second:?}");
        };

        // Flow is consumed.
        assert!(matches!(
            broker.poll(&store, "user-1", &flow.flow_id).await,
            Err(VaultError::FlowExpired)
        ));

        // Tokens are usable without a refresh (expiry is an hour out).
        let cred = store.credential_for_run(&credential_id, "user-1").await.unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&cred.token), "at_1");
    }

    #[tokio::test]
    async fn slow_down_stretches_interval() {
        let app = device_code_route().route(
            "/token",
            post(|| async { axum::Json(serde_json::json!({"error": "slow_down"})) }),
        );
        let base = start_mock(app).await;
        let store = store_with_endpoints(&base).await;
        let broker = DeviceFlowBroker::new();

        let flow = broker.initiate(&store, "user-1", "anthropic").await.unwrap();
        let outcome = broker.poll(&store, "user-1", &flow.flow_id).await.unwrap();
        assert_eq!(outcome, PollOutcome::SlowDown { interval: 10 });

        // The stretched interval sticks for subsequent polls.
        let outcome = broker.poll(&store, "user-1", &flow.flow_id).await.unwrap();
        assert_eq!(outcome, PollOutcome::SlowDown { interval: 15 });
    }

    #[tokio::test]
    async fn denial_ends_the_flow() {
        let app = device_code_route().route(
            "/token",
            post(|| async { axum::Json(serde_json::json!({"error": "access_denied"})) }),
        );
        let base = start_mock(app).await;
        let store = store_with_endpoints(&base).await;
        let broker = DeviceFlowBroker::new();

        let flow = broker.initiate(&store, "user-1", "anthropic").await.unwrap();
        let outcome = broker.poll(&store, "user-1", &flow.flow_id).await.unwrap();
        assert_eq!(outcome, PollOutcome::Error {
            message: "access_denied".into(),
        });
        assert!(matches!(
            broker.poll(&store, "user-1", &flow.flow_id).await,
            Err(VaultError::FlowExpired)
        ));
    }

    #[tokio::test]
    async fn foreign_user_cannot_poll() {
        let base = start_mock(device_code_route()).await;
        let store = store_with_endpoints(&base).await;
        let broker = DeviceFlowBroker::new();

        let flow = broker.initiate(&store, "user-1", "anthropic").await.unwrap();
        assert!(matches!(
            broker.poll(&store, "user-2", &flow.flow_id).await,
            Err(VaultError::FlowExpired)
        ));
    }
}
