//! Lazily-refreshed map of enabled providers to backend instances.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

use crate::{
    catalog::CatalogStore,
    cloud::CloudBackend,
    local::LocalBackend,
    provider::{ComputeProvider, ProvisionError},
    sandbox::SandboxBackend,
};

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Connection settings for the concrete backends.
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub cloud_api_url: String,
    pub cloud_api_token: String,
    pub sandbox_dispatch_url: String,
    pub sandbox_api_token: String,
}

struct CacheState {
    by_id: HashMap<String, Arc<dyn ComputeProvider>>,
    refreshed_at: Instant,
}

/// Resolves a CloudProvider catalog row to a [`ComputeProvider`] backend.
/// Stale reads during refresh windows are fine; admission re-checks rows in
/// its own transaction.
pub struct ProviderRegistry {
    catalog: Arc<CatalogStore>,
    settings: BackendSettings,
    cache: RwLock<Option<CacheState>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(catalog: Arc<CatalogStore>, settings: BackendSettings) -> Self {
        Self {
            catalog,
            settings,
            cache: RwLock::new(None),
        }
    }

    /// Backend for an enabled provider id.
    pub async fn backend(&self, provider_id: &str) -> Result<Arc<dyn ComputeProvider>, ProvisionError> {
        {
            let cache = self.cache.read().await;
            if let Some(state) = cache.as_ref()
                && state.refreshed_at.elapsed() < CACHE_TTL
                && let Some(backend) = state.by_id.get(provider_id)
            {
                return Ok(Arc::clone(backend));
            }
        }

        let mut cache = self.cache.write().await;
        // Re-check under the write lock; another task may have refreshed.
        if let Some(state) = cache.as_ref()
            && state.refreshed_at.elapsed() < CACHE_TTL
            && let Some(backend) = state.by_id.get(provider_id)
        {
            return Ok(Arc::clone(backend));
        }

        let rows = self
            .catalog
            .enabled_providers()
            .await
            .map_err(|e| ProvisionError::Failed(format!("catalog read failed: {e}")))?;

        let mut by_id: HashMap<String, Arc<dyn ComputeProvider>> = HashMap::new();
        for row in rows {
            let backend: Arc<dyn ComputeProvider> = if row.name.eq_ignore_ascii_case("local") {
                Arc::new(LocalBackend)
            } else if row.is_sandbox {
                Arc::new(SandboxBackend::new(
                    self.settings.sandbox_dispatch_url.clone(),
                    self.settings.sandbox_api_token.clone(),
                ))
            } else {
                Arc::new(CloudBackend::new(
                    self.settings.cloud_api_url.clone(),
                    self.settings.cloud_api_token.clone(),
                ))
            };
            by_id.insert(row.id, backend);
        }

        let backend = by_id.get(provider_id).cloned();
        *cache = Some(CacheState {
            by_id,
            refreshed_at: Instant::now(),
        });

        backend.ok_or_else(|| {
            ProvisionError::Failed(format!("no enabled provider with id {provider_id}"))
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn resolves_local_by_name() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = Arc::new(CatalogStore::new(pool).await.unwrap());
        let local_id = catalog.add_provider("Local", false).await.unwrap();

        let registry = ProviderRegistry::new(catalog, BackendSettings::default());
        // The local backend has no remote API, so a create succeeds offline.
        let backend = registry.backend(&local_id).await.unwrap();
        let created = backend
            .create_workspace(&crate::provider::CreateWorkspaceRequest {
                workspace_id: "ws-1".into(),
                user_id: "user-1".into(),
                image_id: "img".into(),
                subdomain: "demo".into(),
                repo_url: None,
                region_identifier: "local".into(),
                env: HashMap::new(),
                persistent: false,
            })
            .await
            .unwrap();
        assert!(created.external_service_id.starts_with("local-"));
    }

    #[tokio::test]
    async fn disabled_provider_is_not_resolved() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = Arc::new(CatalogStore::new(pool).await.unwrap());
        let id = catalog.add_provider("railway", false).await.unwrap();
        catalog
            .set_enabled(crate::catalog::CatalogTable::CloudProviders, &id, false)
            .await
            .unwrap();

        let registry = ProviderRegistry::new(catalog, BackendSettings::default());
        assert!(registry.backend(&id).await.is_err());
    }
}
