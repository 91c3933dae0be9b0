//! SQLite persistence for workspaces and their volumes.

use std::collections::HashMap;

use {
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use berth_common::{
    Error, Result,
    ids::new_id,
    time,
    types::{HostingType, WorkspaceStatus},
};
use berth_protocol::frames::ExposedPort;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub user_id: String,
    pub subdomain: String,
    pub domain: String,
    pub name: String,
    pub cloud_provider_id: String,
    pub region_id: String,
    pub image_id: String,
    pub external_instance_id: String,
    pub external_running_deployment_id: Option<String>,
    pub upstream_url: Option<String>,
    pub hosting_type: HostingType,
    pub persistent: bool,
    pub server_only: bool,
    pub git_integration_id: Option<String>,
    pub repository_url: Option<String>,
    pub status: WorkspaceStatus,
    pub started_at: Option<String>,
    pub last_active_at: Option<String>,
    pub stopped_at: Option<String>,
    pub terminated_at: Option<String>,
    pub local_port: Option<u16>,
    pub exposed_ports: Option<HashMap<String, ExposedPort>>,
    pub tunnel_connected_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub workspace_id: String,
    pub external_volume_id: String,
    pub mount_path: String,
}

/// Fork lineage for a workspace: which upstream repository its fork came
/// from and where the fork lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceGitConfig {
    pub id: String,
    pub workspace_id: String,
    pub upstream_owner: String,
    pub upstream_name: String,
    pub fork_owner: String,
    pub fork_name: String,
    pub fork_url: String,
}

fn row_to_workspace(row: &SqliteRow) -> Result<Workspace> {
    let hosting: String = row.get("hosting_type");
    let status: String = row.get("status");
    let exposed_ports: Option<String> = row.get("exposed_ports");
    let local_port: Option<i64> = row.get("local_port");

    Ok(Workspace {
        id: row.get("id"),
        user_id: row.get("user_id"),
        subdomain: row.get("subdomain"),
        domain: row.get("domain"),
        name: row.get("name"),
        cloud_provider_id: row.get("cloud_provider_id"),
        region_id: row.get("region_id"),
        image_id: row.get("image_id"),
        external_instance_id: row.get("external_instance_id"),
        external_running_deployment_id: row.get("external_running_deployment_id"),
        upstream_url: row.get("upstream_url"),
        hosting_type: HostingType::parse(&hosting)
            .ok_or_else(|| Error::internal("malformed hosting_type"))?,
        persistent: row.get("persistent"),
        server_only: row.get("server_only"),
        git_integration_id: row.get("git_integration_id"),
        repository_url: row.get("repository_url"),
        status: WorkspaceStatus::parse(&status)
            .ok_or_else(|| Error::internal("malformed workspace status"))?,
        started_at: row.get("started_at"),
        last_active_at: row.get("last_active_at"),
        stopped_at: row.get("stopped_at"),
        terminated_at: row.get("terminated_at"),
        local_port: local_port.map(|p| p as u16),
        exposed_ports: exposed_ports.and_then(|raw| serde_json::from_str(&raw).ok()),
        tunnel_connected_at: row.get("tunnel_connected_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const WORKSPACE_COLUMNS: &str = "id, user_id, subdomain, domain, name, cloud_provider_id, \
     region_id, image_id, external_instance_id, external_running_deployment_id, upstream_url, \
     hosting_type, persistent, server_only, git_integration_id, repository_url, status, \
     started_at, last_active_at, stopped_at, terminated_at, local_port, exposed_ports, \
     tunnel_connected_at, created_at, updated_at";

pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subdomain TEXT NOT NULL,
                domain TEXT NOT NULL,
                name TEXT NOT NULL,
                cloud_provider_id TEXT NOT NULL,
                region_id TEXT NOT NULL,
                image_id TEXT NOT NULL,
                external_instance_id TEXT NOT NULL,
                external_running_deployment_id TEXT,
                upstream_url TEXT,
                hosting_type TEXT NOT NULL,
                persistent INTEGER NOT NULL DEFAULT 0,
                server_only INTEGER NOT NULL DEFAULT 0,
                git_integration_id TEXT,
                repository_url TEXT,
                status TEXT NOT NULL,
                started_at TEXT,
                last_active_at TEXT,
                stopped_at TEXT,
                terminated_at TEXT,
                local_port INTEGER,
                exposed_ports TEXT,
                tunnel_connected_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workspaces_subdomain
             ON workspaces (subdomain) WHERE status != 'terminated'",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS volumes (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                external_volume_id TEXT NOT NULL,
                mount_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workspace_git_configs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL UNIQUE,
                upstream_owner TEXT NOT NULL,
                upstream_name TEXT NOT NULL,
                fork_owner TEXT NOT NULL,
                fork_name TEXT NOT NULL,
                fork_url TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        Ok(())
    }

    pub async fn insert(&self, ws: &Workspace) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO workspaces ({WORKSPACE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&ws.id)
        .bind(&ws.user_id)
        .bind(&ws.subdomain)
        .bind(&ws.domain)
        .bind(&ws.name)
        .bind(&ws.cloud_provider_id)
        .bind(&ws.region_id)
        .bind(&ws.image_id)
        .bind(&ws.external_instance_id)
        .bind(&ws.external_running_deployment_id)
        .bind(&ws.upstream_url)
        .bind(ws.hosting_type.as_str())
        .bind(ws.persistent)
        .bind(ws.server_only)
        .bind(&ws.git_integration_id)
        .bind(&ws.repository_url)
        .bind(ws.status.as_str())
        .bind(&ws.started_at)
        .bind(&ws.last_active_at)
        .bind(&ws.stopped_at)
        .bind(&ws.terminated_at)
        .bind(ws.local_port.map(i64::from))
        .bind(
            ws.exposed_ports
                .as_ref()
                .and_then(|m| serde_json::to_string(m).ok()),
        )
        .bind(&ws.tunnel_connected_at)
        .bind(&ws.created_at)
        .bind(&ws.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(row_to_workspace).transpose()
    }

    /// Fetch enforcing ownership; NotFound hides other users' workspaces.
    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<Workspace> {
        let ws = self.get(id).await?.ok_or_else(|| Error::not_found("workspace not found"))?;
        if ws.user_id != user_id {
            return Err(Error::not_found("workspace not found"));
        }
        Ok(ws)
    }

    /// The non-terminated holder of a subdomain, if any.
    pub async fn find_active_by_subdomain(&self, subdomain: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
             WHERE subdomain = ? AND status != 'terminated'"
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(row_to_workspace).transpose()
    }

    /// Resolve the non-terminated workspace backing an external service id
    /// (deploy-webhook path).
    pub async fn find_active_by_external_instance(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
             WHERE external_instance_id = ? AND status != 'terminated'"
        ))
        .bind(external_instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(row_to_workspace).transpose()
    }

    pub async fn count_active_for_user(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM workspaces WHERE user_id = ? AND status != 'terminated'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.get("n"))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Workspace>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
             WHERE user_id = ? AND status != 'terminated' ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        rows.iter().map(row_to_workspace).collect()
    }

    // ── Transitions ──────────────────────────────────────────────────────
    //
    // Each transition runs in a transaction that re-reads the current status
    // under the write lock, so concurrent stop+terminate collapse to one
    // terminal state.

    async fn transition(
        &self,
        id: &str,
        to: WorkspaceStatus,
        extra_sql: &str,
        extra_binds: &[Option<String>],
    ) -> Result<Workspace> {
        let mut tx = self.pool.begin().await.map_err(Error::other)?;

        let row = sqlx::query("SELECT status FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::other)?
            .ok_or_else(|| Error::not_found("workspace not found"))?;
        let current = WorkspaceStatus::parse(&row.get::<String, _>("status"))
            .ok_or_else(|| Error::internal("malformed workspace status"))?;

        if current == to && to == WorkspaceStatus::Terminated {
            // Terminate is idempotent: the second call observes the same row.
            tx.commit().await.map_err(Error::other)?;
            return self
                .get(id)
                .await?
                .ok_or_else(|| Error::not_found("workspace not found"));
        }
        if !current.can_transition_to(to) {
            return Err(Error::bad_request(format!(
                "cannot transition workspace from {} to {}",
                current.as_str(),
                to.as_str()
            )));
        }

        let sql = format!(
            "UPDATE workspaces SET status = ?, updated_at = ?{extra_sql} WHERE id = ?"
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(time::now_rfc3339());
        for bind in extra_binds {
            query = query.bind(bind);
        }
        query
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;

        tx.commit().await.map_err(Error::other)?;
        self.get(id)
            .await?
            .ok_or_else(|| Error::not_found("workspace not found"))
    }

    pub async fn mark_running(&self, id: &str, deployment_id: Option<&str>) -> Result<Workspace> {
        let now = time::now_rfc3339();
        self.transition(
            id,
            WorkspaceStatus::Running,
            ", external_running_deployment_id = ?, started_at = ?, last_active_at = ?",
            &[
                deployment_id.map(str::to_string),
                Some(now.clone()),
                Some(now),
            ],
        )
        .await
    }

    pub async fn mark_stopped(&self, id: &str) -> Result<Workspace> {
        self.transition(
            id,
            WorkspaceStatus::Stopped,
            ", stopped_at = ?, external_running_deployment_id = NULL",
            &[Some(time::now_rfc3339())],
        )
        .await
    }

    /// Restart path: back to pending, clearing the stop marker.
    pub async fn mark_pending(&self, id: &str) -> Result<Workspace> {
        self.transition(
            id,
            WorkspaceStatus::Pending,
            ", stopped_at = NULL",
            &[],
        )
        .await
    }

    pub async fn mark_terminated(&self, id: &str) -> Result<Workspace> {
        self.transition(
            id,
            WorkspaceStatus::Terminated,
            ", terminated_at = ?",
            &[Some(time::now_rfc3339())],
        )
        .await
    }

    pub async fn touch_last_active(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET last_active_at = ?, updated_at = ? WHERE id = ?")
            .bind(time::now_rfc3339())
            .bind(time::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
        Ok(())
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(time::now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
        Ok(())
    }

    /// Record the tunnel's port announcement.
    pub async fn update_ports(
        &self,
        id: &str,
        local_port: Option<u16>,
        exposed_ports: &HashMap<String, ExposedPort>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workspaces
             SET local_port = ?, exposed_ports = ?, tunnel_connected_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(local_port.map(i64::from))
        .bind(serde_json::to_string(exposed_ports).map_err(Error::other)?)
        .bind(time::now_rfc3339())
        .bind(time::now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    // ── Reaper queries ───────────────────────────────────────────────────

    /// Running cloud workspaces idle since before `cutoff`.
    pub async fn idle_running_cloud(&self, cutoff: &str) -> Result<Vec<Workspace>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
             WHERE status = 'running' AND hosting_type = 'cloud' AND last_active_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        rows.iter().map(row_to_workspace).collect()
    }

    /// Running cloud workspaces owned by any of `user_ids`.
    pub async fn running_cloud_for_users(&self, user_ids: &[String]) -> Result<Vec<Workspace>> {
        let mut out = Vec::new();
        for user_id in user_ids {
            let rows = sqlx::query(&format!(
                "SELECT {WORKSPACE_COLUMNS} FROM workspaces
                 WHERE status = 'running' AND hosting_type = 'cloud' AND user_id = ?"
            ))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::other)?;
            for row in &rows {
                out.push(row_to_workspace(row)?);
            }
        }
        Ok(out)
    }

    /// Cloud workspaces (running or stopped) inactive since before `cutoff`.
    pub async fn long_term_inactive_cloud(&self, cutoff: &str) -> Result<Vec<Workspace>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
             WHERE status IN ('running', 'stopped') AND hosting_type = 'cloud'
               AND last_active_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        rows.iter().map(row_to_workspace).collect()
    }

    // ── Volumes ──────────────────────────────────────────────────────────

    pub async fn insert_volume(
        &self,
        workspace_id: &str,
        external_volume_id: &str,
        mount_path: &str,
    ) -> Result<String> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO volumes (id, workspace_id, external_volume_id, mount_path, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(external_volume_id)
        .bind(mount_path)
        .bind(time::now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(id)
    }

    pub async fn volume_for_workspace(&self, workspace_id: &str) -> Result<Option<Volume>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, external_volume_id, mount_path
             FROM volumes WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.map(|r| Volume {
            id: r.get("id"),
            workspace_id: r.get("workspace_id"),
            external_volume_id: r.get("external_volume_id"),
            mount_path: r.get("mount_path"),
        }))
    }

    pub async fn delete_volume(&self, workspace_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM volumes WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
        Ok(())
    }

    // ── Fork lineage ─────────────────────────────────────────────────────

    /// Record where a workspace's fork came from. Re-forking replaces the
    /// previous lineage row.
    pub async fn record_fork(
        &self,
        workspace_id: &str,
        upstream_owner: &str,
        upstream_name: &str,
        fork_owner: &str,
        fork_name: &str,
        fork_url: &str,
    ) -> Result<String> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO workspace_git_configs
                 (id, workspace_id, upstream_owner, upstream_name, fork_owner, fork_name,
                  fork_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (workspace_id) DO UPDATE SET
                 upstream_owner = excluded.upstream_owner,
                 upstream_name = excluded.upstream_name,
                 fork_owner = excluded.fork_owner,
                 fork_name = excluded.fork_name,
                 fork_url = excluded.fork_url",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(upstream_owner)
        .bind(upstream_name)
        .bind(fork_owner)
        .bind(fork_name)
        .bind(fork_url)
        .bind(time::now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(id)
    }

    pub async fn fork_config(&self, workspace_id: &str) -> Result<Option<WorkspaceGitConfig>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, upstream_owner, upstream_name, fork_owner, fork_name, fork_url
             FROM workspace_git_configs WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.map(|r| WorkspaceGitConfig {
            id: r.get("id"),
            workspace_id: r.get("workspace_id"),
            upstream_owner: r.get("upstream_owner"),
            upstream_name: r.get("upstream_name"),
            fork_owner: r.get("fork_owner"),
            fork_name: r.get("fork_name"),
            fork_url: r.get("fork_url"),
        }))
    }
}
