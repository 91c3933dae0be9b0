//! Admin-managed placement catalog: providers, regions, agent types, images.

use {
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool},
};

use berth_common::{ids::new_id, time};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderRow {
    pub id: String,
    /// Selects the concrete `ComputeProvider` implementation.
    pub name: String,
    pub is_sandbox: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionRow {
    pub id: String,
    pub cloud_provider_id: String,
    pub name: String,
    /// Passed to the provider unchanged.
    pub external_region_identifier: String,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeRow {
    pub id: String,
    pub name: String,
    /// Restricted to local-tunnel workspaces.
    pub server_only: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRow {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub agent_type_id: String,
    pub is_enabled: bool,
}

pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cloud_providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                is_sandbox INTEGER NOT NULL DEFAULT 0,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS regions (
                id TEXT PRIMARY KEY,
                cloud_provider_id TEXT NOT NULL,
                name TEXT NOT NULL,
                external_region_identifier TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                server_only INTEGER NOT NULL DEFAULT 0,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                image_id TEXT NOT NULL,
                agent_type_id TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Admin writes ─────────────────────────────────────────────────────

    pub async fn add_provider(&self, name: &str, is_sandbox: bool) -> Result<String, sqlx::Error> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO cloud_providers (id, name, is_sandbox, is_enabled, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(is_sandbox)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn add_region(
        &self,
        cloud_provider_id: &str,
        name: &str,
        external_region_identifier: &str,
    ) -> Result<String, sqlx::Error> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO regions
                 (id, cloud_provider_id, name, external_region_identifier, is_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(cloud_provider_id)
        .bind(name)
        .bind(external_region_identifier)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn add_agent_type(&self, name: &str, server_only: bool) -> Result<String, sqlx::Error> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO agent_types (id, name, server_only, is_enabled, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(server_only)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn add_image(
        &self,
        name: &str,
        image_id: &str,
        agent_type_id: &str,
    ) -> Result<String, sqlx::Error> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO images (id, name, image_id, agent_type_id, is_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(image_id)
        .bind(agent_type_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Disable any catalog row. Disabled rows never satisfy a create request.
    pub async fn set_enabled(
        &self,
        table: CatalogTable,
        id: &str,
        enabled: bool,
    ) -> Result<(), sqlx::Error> {
        let sql = match table {
            CatalogTable::CloudProviders => {
                "UPDATE cloud_providers SET is_enabled = ?, updated_at = ? WHERE id = ?"
            },
            CatalogTable::Regions => "UPDATE regions SET is_enabled = ?, updated_at = ? WHERE id = ?",
            CatalogTable::AgentTypes => {
                "UPDATE agent_types SET is_enabled = ?, updated_at = ? WHERE id = ?"
            },
            CatalogTable::Images => "UPDATE images SET is_enabled = ?, updated_at = ? WHERE id = ?",
        };
        sqlx::query(sql)
            .bind(enabled)
            .bind(time::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub async fn provider(&self, id: &str) -> Result<Option<CloudProviderRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, is_sandbox, is_enabled FROM cloud_providers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CloudProviderRow {
            id: r.get("id"),
            name: r.get("name"),
            is_sandbox: r.get("is_sandbox"),
            is_enabled: r.get("is_enabled"),
        }))
    }

    pub async fn enabled_providers(&self) -> Result<Vec<CloudProviderRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, name, is_sandbox, is_enabled FROM cloud_providers WHERE is_enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| CloudProviderRow {
                id: r.get("id"),
                name: r.get("name"),
                is_sandbox: r.get("is_sandbox"),
                is_enabled: r.get("is_enabled"),
            })
            .collect())
    }

    pub async fn region(&self, id: &str) -> Result<Option<RegionRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, cloud_provider_id, name, external_region_identifier, is_enabled
             FROM regions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| RegionRow {
            id: r.get("id"),
            cloud_provider_id: r.get("cloud_provider_id"),
            name: r.get("name"),
            external_region_identifier: r.get("external_region_identifier"),
            is_enabled: r.get("is_enabled"),
        }))
    }

    pub async fn agent_type(&self, id: &str) -> Result<Option<AgentTypeRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, server_only, is_enabled FROM agent_types WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AgentTypeRow {
            id: r.get("id"),
            name: r.get("name"),
            server_only: r.get("server_only"),
            is_enabled: r.get("is_enabled"),
        }))
    }

    /// The enabled image for an agent type, if one exists.
    pub async fn image_for_agent_type(
        &self,
        agent_type_id: &str,
    ) -> Result<Option<ImageRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, image_id, agent_type_id, is_enabled
             FROM images WHERE agent_type_id = ? AND is_enabled = 1 LIMIT 1",
        )
        .bind(agent_type_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ImageRow {
            id: r.get("id"),
            name: r.get("name"),
            image_id: r.get("image_id"),
            agent_type_id: r.get("agent_type_id"),
            is_enabled: r.get("is_enabled"),
        }))
    }
}

/// Catalog table selector for [`CatalogStore::set_enabled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    CloudProviders,
    Regions,
    AgentTypes,
    Images,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CatalogStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        CatalogStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn catalog_round_trip() {
        let store = store().await;
        let provider_id = store.add_provider("railway", false).await.unwrap();
        let region_id = store
            .add_region(&provider_id, "us-west", "us-west1-a")
            .await
            .unwrap();
        let agent_type_id = store.add_agent_type("devbox", false).await.unwrap();
        store
            .add_image("devbox-base", "img-abc123", &agent_type_id)
            .await
            .unwrap();

        let provider = store.provider(&provider_id).await.unwrap().unwrap();
        assert_eq!(provider.name, "railway");
        assert!(!provider.is_sandbox);

        let region = store.region(&region_id).await.unwrap().unwrap();
        assert_eq!(region.external_region_identifier, "us-west1-a");
        assert_eq!(region.cloud_provider_id, provider_id);

        let image = store
            .image_for_agent_type(&agent_type_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(image.image_id, "img-abc123");
    }

    #[tokio::test]
    async fn disabled_image_is_invisible() {
        let store = store().await;
        let agent_type_id = store.add_agent_type("devbox", false).await.unwrap();
        let image_id = store
            .add_image("devbox-base", "img-1", &agent_type_id)
            .await
            .unwrap();

        store
            .set_enabled(CatalogTable::Images, &image_id, false)
            .await
            .unwrap();
        assert!(store
            .image_for_agent_type(&agent_type_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn enabled_providers_filters() {
        let store = store().await;
        let keep = store.add_provider("railway", false).await.unwrap();
        let disable = store.add_provider("flyio", false).await.unwrap();
        store
            .set_enabled(CatalogTable::CloudProviders, &disable, false)
            .await
            .unwrap();

        let enabled = store.enabled_providers().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, keep);
    }
}
