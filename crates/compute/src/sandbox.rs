//! Sandbox-only backend: dispatches agent-loop runs to an external executor
//! and rejects workspace provisioning.

use std::time::Duration;

use {async_trait::async_trait, serde::Deserialize, tracing::info};

use crate::provider::{
    ComputeProvider, CreateWorkspaceRequest, CreatedWorkspace, ProvisionError, RunDescriptor,
    SandboxAck,
};

/// How long to wait for the executor's acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    acknowledged: bool,
    #[serde(default)]
    sandbox_id: Option<String>,
}

pub struct SandboxBackend {
    http: reqwest::Client,
    dispatch_url: String,
    api_token: String,
}

impl SandboxBackend {
    #[must_use]
    pub fn new(dispatch_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            dispatch_url: dispatch_url.into(),
            api_token: api_token.into(),
        }
    }
}

#[async_trait]
impl ComputeProvider for SandboxBackend {
    async fn create_workspace(
        &self,
        _req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        Err(ProvisionError::Unsupported(
            "sandbox providers do not host workspaces".into(),
        ))
    }

    async fn create_persistent_workspace(
        &self,
        _req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        Err(ProvisionError::Unsupported(
            "sandbox providers do not host workspaces".into(),
        ))
    }

    async fn stop_workspace(
        &self,
        _external_service_id: &str,
        _region_identifier: &str,
        _running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Err(ProvisionError::Unsupported(
            "sandbox providers do not host workspaces".into(),
        ))
    }

    async fn restart_workspace(
        &self,
        _external_service_id: &str,
        _region_identifier: &str,
        _running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Err(ProvisionError::Unsupported(
            "sandbox providers do not host workspaces".into(),
        ))
    }

    async fn terminate_workspace(
        &self,
        _external_service_id: &str,
        _external_volume_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Err(ProvisionError::Unsupported(
            "sandbox providers do not host workspaces".into(),
        ))
    }

    async fn start_sandbox_run(
        &self,
        descriptor: &RunDescriptor,
    ) -> Result<SandboxAck, ProvisionError> {
        let resp = self
            .http
            .post(&self.dispatch_url)
            .bearer_auth(&self.api_token)
            .timeout(ACK_TIMEOUT)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() >= 500 {
                return Err(ProvisionError::Transient(format!("{status}: {text}")));
            }
            return Err(ProvisionError::Failed(format!("{status}: {text}")));
        }

        let body: DispatchResponse = resp
            .json()
            .await
            .map_err(|e| ProvisionError::Failed(format!("malformed dispatch response: {e}")))?;

        info!(
            run_id = %descriptor.run_id,
            acknowledged = body.acknowledged,
            sandbox_id = body.sandbox_id.as_deref().unwrap_or("-"),
            "sandbox dispatch"
        );
        Ok(SandboxAck {
            acknowledged: body.acknowledged,
            sandbox_id: body.sandbox_id,
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};

    async fn start_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn descriptor() -> RunDescriptor {
        RunDescriptor {
            run_id: "run-1".into(),
            loop_id: "loop-1".into(),
            repository_owner: "acme".into(),
            repository_name: "app".into(),
            branch: "main".into(),
            plan_file_path: "PLAN.md".into(),
            progress_file_path: None,
            model_provider: "anthropic".into(),
            model_id: "claude".into(),
            model_token: Some("sk-test".into()),
            prompt: None,
            callback_url: "http://control-plane/trpc/agentLoop.handleWebhook".into(),
            callback_secret: "cb-secret".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_returns_ack() {
        let app = Router::new().route(
            "/dispatch",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["runId"], "run-1");
                assert_eq!(body["callbackSecret"], "cb-secret");
                Json(serde_json::json!({"acknowledged": true, "sandbox_id": "sbx-7"}))
            }),
        );
        let base = start_mock(app).await;

        let ack = SandboxBackend::new(format!("{base}/dispatch"), "token")
            .start_sandbox_run(&descriptor())
            .await
            .unwrap();
        assert!(ack.acknowledged);
        assert_eq!(ack.sandbox_id.as_deref(), Some("sbx-7"));
    }

    #[tokio::test]
    async fn non_ack_is_reported_not_errored() {
        let app = Router::new().route(
            "/dispatch",
            post(|| async { Json(serde_json::json!({"acknowledged": false})) }),
        );
        let base = start_mock(app).await;

        let ack = SandboxBackend::new(format!("{base}/dispatch"), "token")
            .start_sandbox_run(&descriptor())
            .await
            .unwrap();
        assert!(!ack.acknowledged);
        assert!(ack.sandbox_id.is_none());
    }

    #[tokio::test]
    async fn workspace_ops_are_rejected() {
        let backend = SandboxBackend::new("http://unused", "token");
        assert!(matches!(
            backend.stop_workspace("x", "r", None).await,
            Err(ProvisionError::Unsupported(_))
        ));
    }
}
