//! Users, browser sessions, and git integrations.
//!
//! Session issuance belongs to the external identity service; it writes
//! `auth_sessions` rows through the internal RPC and this store only
//! validates them.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool},
};

use berth_common::{
    Error, Result,
    ids::new_id,
    time,
    types::{Plan, Role},
};
use berth_workspaces::{PlanLookup, UserContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub github_username: Option<String>,
    pub role: Role,
    pub plan: Plan,
}

impl User {
    #[must_use]
    pub fn context(&self) -> UserContext {
        UserContext {
            id: self.id.clone(),
            email: self.email.clone(),
            plan: self.plan,
            github_username: self.github_username.clone(),
        }
    }
}

pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                github_username TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                plan TEXT NOT NULL DEFAULT 'free',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth_sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS git_integrations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                installation_id TEXT NOT NULL,
                account_login TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        Ok(())
    }

    fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let role: String = row.get("role");
        let plan: String = row.get("plan");
        Ok(User {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
            github_username: row.get("github_username"),
            role: if role == "admin" { Role::Admin } else { Role::User },
            plan: Plan::parse(&plan).ok_or_else(|| Error::internal("malformed plan"))?,
        })
    }

    /// Create or update a user by email. The external auth service is the
    /// writer; role/plan changes come through admin RPC.
    pub async fn upsert_user(
        &self,
        email: &str,
        display_name: &str,
        github_username: Option<&str>,
    ) -> Result<User> {
        let now = time::now_rfc3339();
        if let Some(existing) = self.user_by_email(email).await? {
            sqlx::query(
                "UPDATE users SET display_name = ?, github_username = COALESCE(?, github_username),
                        updated_at = ?
                 WHERE id = ?",
            )
            .bind(display_name)
            .bind(github_username)
            .bind(&now)
            .bind(&existing.id)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
            return self
                .user(&existing.id)
                .await?
                .ok_or_else(|| Error::internal("user vanished"));
        }

        let id = new_id();
        sqlx::query(
            "INSERT INTO users (id, email, display_name, github_username, role, plan, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'user', 'free', ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(display_name)
        .bind(github_username)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        self.user(&id)
            .await?
            .ok_or_else(|| Error::internal("user vanished after insert"))
    }

    pub async fn user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, github_username, role, plan FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, github_username, role, plan FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    /// Admin mutation.
    pub async fn set_plan(&self, user_id: &str, plan: Plan) -> Result<()> {
        sqlx::query("UPDATE users SET plan = ?, updated_at = ? WHERE id = ?")
            .bind(plan.as_str())
            .bind(time::now_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Record a session issued by the identity service.
    pub async fn create_session(&self, user_id: &str, ttl_days: i64) -> Result<String> {
        let token = format!("sess_{}", new_id());
        let expires = (time::now() + chrono::Duration::days(ttl_days)).to_rfc3339();
        sqlx::query(
            "INSERT INTO auth_sessions (token, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(user_id)
        .bind(&expires)
        .bind(time::now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(token)
    }

    /// Resolve a live session to its user.
    pub async fn validate_session(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT user_id FROM auth_sessions WHERE token = ? AND expires_at > ?",
        )
        .bind(token)
        .bind(time::now_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        let Some(row) = row else {
            return Ok(None);
        };
        self.user(&row.get::<String, _>("user_id")).await
    }

    // ── Git integrations ─────────────────────────────────────────────────

    pub async fn add_git_integration(
        &self,
        user_id: &str,
        provider: &str,
        installation_id: &str,
        account_login: &str,
    ) -> Result<String> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO git_integrations
                 (id, user_id, provider, installation_id, account_login, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(provider)
        .bind(installation_id)
        .bind(account_login)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(id)
    }
}

#[async_trait]
impl PlanLookup for IdentityStore {
    async fn plan_for(&self, user_id: &str) -> Result<Plan> {
        Ok(self
            .user(user_id)
            .await?
            .map(|u| u.plan)
            .unwrap_or(Plan::Free))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> IdentityStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        IdentityStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_email() {
        let store = store().await;
        let first = store.upsert_user("a@example.dev", "Ada", Some("ada")).await.unwrap();
        let second = store.upsert_user("a@example.dev", "Ada L.", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "Ada L.");
        // COALESCE keeps the known github username.
        assert_eq!(second.github_username.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn sessions_validate_and_expire() {
        let store = store().await;
        let user = store.upsert_user("a@example.dev", "Ada", None).await.unwrap();

        let token = store.create_session(&user.id, 30).await.unwrap();
        let resolved = store.validate_session(&token).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);

        assert!(store.validate_session("sess_bogus").await.unwrap().is_none());

        // Expired sessions stop validating.
        let stale = store.create_session(&user.id, -1).await.unwrap();
        assert!(store.validate_session(&stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_lookup_defaults_to_free() {
        let store = store().await;
        assert_eq!(store.plan_for("missing").await.unwrap(), Plan::Free);

        let user = store.upsert_user("a@example.dev", "Ada", None).await.unwrap();
        store.set_plan(&user.id, Plan::Pro).await.unwrap();
        assert_eq!(store.plan_for(&user.id).await.unwrap(), Plan::Pro);
    }
}
