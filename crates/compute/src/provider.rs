//! The [`ComputeProvider`] trait and its request/response types.

use std::collections::HashMap;

use {async_trait::async_trait, serde::Serialize};

use berth_common::{Error, ErrorKind};

/// Provisioning failures, classified so the orchestrator can decide whether
/// to surface, reject, or retry.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The upstream account is out of capacity.
    #[error("provider quota denied: {0}")]
    QuotaDenied(String),

    /// The requested region is disabled upstream.
    #[error("region disabled upstream: {0}")]
    RegionDisabled(String),

    /// Worth retrying: connect failures, 5xx, timeouts.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The external resource no longer exists.
    #[error("external resource not found")]
    NotFound,

    /// This backend does not support the requested operation.
    #[error("{0}")]
    Unsupported(String),

    /// Terminal failure.
    #[error("provider failure: {0}")]
    Failed(String),
}

impl From<ProvisionError> for Error {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::QuotaDenied(msg) => {
                Error::new(ErrorKind::Forbidden, format!("provider quota denied: {msg}"))
            },
            ProvisionError::RegionDisabled(msg) => {
                Error::bad_request(format!("region disabled: {msg}"))
            },
            ProvisionError::Transient(msg) | ProvisionError::Failed(msg) => Error::upstream(msg),
            ProvisionError::NotFound => Error::not_found("external resource not found"),
            ProvisionError::Unsupported(msg) => Error::bad_request(msg),
        }
    }
}

/// Everything a backend needs to create a workspace.
#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub workspace_id: String,
    pub user_id: String,
    pub image_id: String,
    pub subdomain: String,
    pub repo_url: Option<String>,
    /// Opaque identifier passed to the provider unchanged.
    pub region_identifier: String,
    pub env: HashMap<String, String>,
    pub persistent: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub external_volume_id: String,
    pub volume_created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreatedWorkspace {
    pub external_service_id: String,
    pub upstream_url: Option<String>,
    pub service_created_at: String,
    /// Present only for persistent creates.
    pub volume: Option<CreatedVolume>,
}

/// Run descriptor handed to a sandbox provider. Serialized as the dispatch
/// request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDescriptor {
    pub run_id: String,
    pub loop_id: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
    pub plan_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_file_path: Option<String>,
    pub model_provider: String,
    pub model_id: String,
    /// API key or OAuth access token for the model provider.
    pub model_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub callback_url: String,
    pub callback_secret: String,
}

/// Acknowledgement-only result of a run dispatch. Completion arrives later
/// via the out-of-band callback.
#[derive(Debug, Clone)]
pub struct SandboxAck {
    pub acknowledged: bool,
    pub sandbox_id: Option<String>,
}

/// One compute backend. All operations are idempotent on the external
/// identifiers they return; callers bound them with their own deadlines
/// (`tokio::time::timeout`) and cancellation.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Provision a non-persistent workspace.
    async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError>;

    /// Provision a workspace with a volume. Both the volume and the service
    /// must succeed, or the whole operation must appear not to have happened.
    async fn create_persistent_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError>;

    /// Stop a running service. A 404 upstream is success (already stopped).
    async fn stop_workspace(
        &self,
        external_service_id: &str,
        region_identifier: &str,
        running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError>;

    /// Restart a stopped service. Same failure semantics as stop.
    async fn restart_workspace(
        &self,
        external_service_id: &str,
        region_identifier: &str,
        running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError>;

    /// Tear down the service and its volume, if any. Idempotent.
    async fn terminate_workspace(
        &self,
        external_service_id: &str,
        external_volume_id: Option<&str>,
    ) -> Result<(), ProvisionError>;

    /// Dispatch an agent-loop run. Only sandbox providers implement this.
    async fn start_sandbox_run(
        &self,
        descriptor: &RunDescriptor,
    ) -> Result<SandboxAck, ProvisionError> {
        let _ = descriptor;
        Err(ProvisionError::Unsupported(
            "this provider does not run sandboxes".into(),
        ))
    }
}

/// Retry an idempotent closure on [`ProvisionError::Transient`], with
/// exponential backoff starting at `base_delay`.
pub(crate) async fn retry_transient<T, F, Fut>(
    attempts: u32,
    base_delay: std::time::Duration,
    mut op: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let mut delay = base_delay;
    let mut last_err = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ProvisionError::Transient(msg)) => {
                tracing::debug!(attempt, error = %msg, "transient provider failure, retrying");
                last_err = Some(ProvisionError::Transient(msg));
                tokio::time::sleep(delay).await;
                delay *= 2;
            },
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| ProvisionError::Failed("retries exhausted".into())))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(3, std::time::Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProvisionError::Transient("503".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_transient(3, std::time::Duration::from_millis(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProvisionError::Transient("503".into()))
            })
            .await;
        assert!(matches!(result, Err(ProvisionError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_terminal_kinds() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_transient(3, std::time::Duration::from_millis(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProvisionError::QuotaDenied("full".into()))
            })
            .await;
        assert!(matches!(result, Err(ProvisionError::QuotaDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn provision_error_maps_to_taxonomy() {
        let err: Error = ProvisionError::QuotaDenied("full".into()).into();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err: Error = ProvisionError::RegionDisabled("eu-1".into()).into();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        let err: Error = ProvisionError::Transient("503".into()).into();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }
}
