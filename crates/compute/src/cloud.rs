//! Cloud backend: drives a deployment HTTP API.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde::Deserialize,
    tracing::{info, warn},
};

use crate::provider::{
    ComputeProvider, CreateWorkspaceRequest, CreatedVolume, CreatedWorkspace, ProvisionError,
    retry_transient,
};

const RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    service_id: String,
    #[serde(default)]
    upstream_url: Option<String>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct VolumeResponse {
    volume_id: String,
    created_at: String,
}

/// Deployment-API-backed provider.
pub struct CloudBackend {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    retry_base_delay: Duration,
}

impl CloudBackend {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            retry_base_delay: Duration::from_millis(250),
        }
    }

    /// Shrink retry backoff; test hook.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> ProvisionError {
        match status.as_u16() {
            402 | 429 => ProvisionError::QuotaDenied(body.to_string()),
            404 => ProvisionError::NotFound,
            409 if body.contains("region") => ProvisionError::RegionDisabled(body.to_string()),
            code if code >= 500 => ProvisionError::Transient(format!("{code}: {body}")),
            code => ProvisionError::Failed(format!("{code}: {body}")),
        }
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProvisionError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &text));
        }
        resp.json()
            .await
            .map_err(|e| ProvisionError::Failed(format!("malformed provider response: {e}")))
    }

    /// POST with an empty body where only the status matters; 404 is success.
    async fn post_lifecycle(&self, path: &str) -> Result<(), ProvisionError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Self::classify_status(status, &text))
    }

    async fn delete(&self, path: &str) -> Result<(), ProvisionError> {
        let resp = self
            .http
            .delete(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Self::classify_status(status, &text))
    }

    fn service_body(req: &CreateWorkspaceRequest, volume_id: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "workspace_id": req.workspace_id,
            "image_id": req.image_id,
            "subdomain": req.subdomain,
            "region": req.region_identifier,
            "repo_url": req.repo_url,
            "env": req.env,
            "volume_id": volume_id,
        })
    }
}

#[async_trait]
impl ComputeProvider for CloudBackend {
    async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        let body = Self::service_body(req, None);
        let service: ServiceResponse = retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
            self.post_json("/services", &body)
        })
        .await?;

        info!(workspace_id = %req.workspace_id, service_id = %service.service_id, "service created");
        Ok(CreatedWorkspace {
            external_service_id: service.service_id,
            upstream_url: service.upstream_url,
            service_created_at: service.created_at,
            volume: None,
        })
    }

    async fn create_persistent_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        let volume_body = serde_json::json!({
            "workspace_id": req.workspace_id,
            "region": req.region_identifier,
        });
        let volume: VolumeResponse = retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
            self.post_json("/volumes", &volume_body)
        })
        .await?;

        let body = Self::service_body(req, Some(&volume.volume_id));
        let service: Result<ServiceResponse, _> =
            retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
                self.post_json("/services", &body)
            })
            .await;

        let service = match service {
            Ok(service) => service,
            Err(e) => {
                // Unwind the volume so the create appears not to have happened.
                if let Err(cleanup) = self.delete(&format!("/volumes/{}", volume.volume_id)).await {
                    warn!(volume_id = %volume.volume_id, error = %cleanup, "volume cleanup failed");
                }
                return Err(e);
            },
        };

        info!(
            workspace_id = %req.workspace_id,
            service_id = %service.service_id,
            volume_id = %volume.volume_id,
            "persistent service created"
        );
        Ok(CreatedWorkspace {
            external_service_id: service.service_id,
            upstream_url: service.upstream_url,
            service_created_at: service.created_at,
            volume: Some(CreatedVolume {
                external_volume_id: volume.volume_id,
                volume_created_at: volume.created_at,
            }),
        })
    }

    async fn stop_workspace(
        &self,
        external_service_id: &str,
        region_identifier: &str,
        running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        let mut path = format!("/services/{external_service_id}/stop?region={region_identifier}");
        if let Some(deployment) = running_deployment_id {
            path.push_str(&format!("&deployment={deployment}"));
        }
        retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
            self.post_lifecycle(&path)
        })
        .await
    }

    async fn restart_workspace(
        &self,
        external_service_id: &str,
        region_identifier: &str,
        running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        let mut path =
            format!("/services/{external_service_id}/restart?region={region_identifier}");
        if let Some(deployment) = running_deployment_id {
            path.push_str(&format!("&deployment={deployment}"));
        }
        retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
            self.post_lifecycle(&path)
        })
        .await
    }

    async fn terminate_workspace(
        &self,
        external_service_id: &str,
        external_volume_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        let service_path = format!("/services/{external_service_id}");
        retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
            self.delete(&service_path)
        })
        .await?;

        if let Some(volume_id) = external_volume_id {
            let volume_path = format!("/volumes/{volume_id}");
            retry_transient(RETRY_ATTEMPTS, self.retry_base_delay, || {
                self.delete(&volume_path)
            })
            .await?;
        }
        Ok(())
    }
}
