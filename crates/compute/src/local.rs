//! Local-tunnel backend. The actual runtime is the user's machine, reached
//! over the tunnel; create/stop/restart here only mint synthetic identifiers
//! so the orchestrator's bookkeeping stays uniform.

use async_trait::async_trait;

use berth_common::{ids::new_id, time};

use crate::provider::{
    ComputeProvider, CreateWorkspaceRequest, CreatedWorkspace, ProvisionError,
};

pub struct LocalBackend;

#[async_trait]
impl ComputeProvider for LocalBackend {
    async fn create_workspace(
        &self,
        _req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        Ok(CreatedWorkspace {
            external_service_id: format!("local-{}", new_id()),
            upstream_url: None,
            service_created_at: time::now_rfc3339(),
            volume: None,
        })
    }

    async fn create_persistent_workspace(
        &self,
        _req: &CreateWorkspaceRequest,
    ) -> Result<CreatedWorkspace, ProvisionError> {
        Err(ProvisionError::Unsupported(
            "local workspaces have no volumes".into(),
        ))
    }

    async fn stop_workspace(
        &self,
        _external_service_id: &str,
        _region_identifier: &str,
        _running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn restart_workspace(
        &self,
        _external_service_id: &str,
        _region_identifier: &str,
        _running_deployment_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn terminate_workspace(
        &self,
        _external_service_id: &str,
        _external_volume_id: Option<&str>,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn create_mints_synthetic_id() {
        let req = CreateWorkspaceRequest {
            workspace_id: "ws-1".into(),
            user_id: "user-1".into(),
            image_id: "img-1".into(),
            subdomain: "demo".into(),
            repo_url: None,
            region_identifier: "local".into(),
            env: HashMap::new(),
            persistent: false,
        };
        let created = LocalBackend.create_workspace(&req).await.unwrap();
        assert!(created.external_service_id.starts_with("local-"));
        assert!(created.upstream_url.is_none());
    }

    #[tokio::test]
    async fn lifecycle_ops_are_noops() {
        LocalBackend.stop_workspace("x", "local", None).await.unwrap();
        LocalBackend.restart_workspace("x", "local", None).await.unwrap();
        LocalBackend.terminate_workspace("x", None).await.unwrap();
    }

    #[tokio::test]
    async fn sandbox_runs_are_rejected() {
        let descriptor = crate::provider::RunDescriptor {
            run_id: "r".into(),
            loop_id: "l".into(),
            repository_owner: "acme".into(),
            repository_name: "app".into(),
            branch: "main".into(),
            plan_file_path: "PLAN.md".into(),
            progress_file_path: None,
            model_provider: "anthropic".into(),
            model_id: "claude".into(),
            model_token: None,
            prompt: None,
            callback_url: "http://cb".into(),
            callback_secret: "s".into(),
        };
        assert!(matches!(
            LocalBackend.start_sandbox_run(&descriptor).await,
            Err(ProvisionError::Unsupported(_))
        ));
    }
}
