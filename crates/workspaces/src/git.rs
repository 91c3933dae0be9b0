//! Git-provider seam. The real GitHub App wrapper lives outside the control
//! plane; the orchestrator only needs installation tokens for the workspace
//! environment and a fork call whose lineage it records.

use async_trait::async_trait;

use berth_common::Result;

#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: String,
}

/// A fork created on the user's account.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ForkedRepository {
    pub owner: String,
    pub name: String,
    pub url: String,
}

/// Operations delegated to a user's git integration.
#[async_trait]
pub trait GitTokenProvider: Send + Sync {
    /// Fetch a fresh app-installation token.
    async fn installation_token(&self, git_integration_id: &str) -> Result<InstallationToken>;

    /// Fork `owner/name` under the integration's account.
    async fn fork_repository(
        &self,
        git_integration_id: &str,
        owner: &str,
        name: &str,
    ) -> Result<ForkedRepository>;
}

/// Stand-in used when no git provider is wired up. Token fetch failures are
/// non-fatal to admission, so this keeps the orchestrator runnable alone;
/// fork requests surface as upstream failures.
pub struct NoopGitTokens;

#[async_trait]
impl GitTokenProvider for NoopGitTokens {
    async fn installation_token(&self, _git_integration_id: &str) -> Result<InstallationToken> {
        Err(berth_common::Error::upstream("no git provider configured"))
    }

    async fn fork_repository(
        &self,
        _git_integration_id: &str,
        _owner: &str,
        _name: &str,
    ) -> Result<ForkedRepository> {
        Err(berth_common::Error::upstream("no git provider configured"))
    }
}
