//! Daily minute counters and per-workspace usage sessions.

use {
    serde::Serialize,
    sqlx::{Row, SqlitePool},
    tracing::{debug, info},
};

use berth_common::{
    Error, Result,
    ids::new_id,
    time,
    types::{Plan, StopSource},
};

/// Deployment-level quota policy; the dynamic minute limit lives in
/// `system_config`.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub enforce_daily_quota: bool,
    pub self_hosted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub used: i64,
    pub remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSessionRow {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub duration_minutes: Option<i64>,
    pub stop_source: Option<String>,
}

pub struct UsageStore {
    pool: SqlitePool,
    policy: QuotaPolicy,
}

impl UsageStore {
    pub async fn new(pool: SqlitePool, policy: QuotaPolicy) -> Result<Self> {
        let store = Self { pool, policy };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS daily_usage (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                minutes_used INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, date)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_sessions (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                duration_minutes INTEGER,
                stop_source TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        Ok(())
    }

    /// Today's usage for a user, creating the row on first call.
    pub async fn ensure_daily_usage(&self, user_id: &str, limit_minutes: i64) -> Result<DailyUsage> {
        let date = time::today_utc();
        sqlx::query(
            "INSERT INTO daily_usage (user_id, date, minutes_used) VALUES (?, ?, 0)
             ON CONFLICT (user_id, date) DO NOTHING",
        )
        .bind(user_id)
        .bind(&date)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        let row = sqlx::query("SELECT minutes_used FROM daily_usage WHERE user_id = ? AND date = ?")
            .bind(user_id)
            .bind(&date)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::other)?;

        let used: i64 = row.get("minutes_used");
        Ok(DailyUsage {
            used,
            remaining: (limit_minutes - used).max(0),
        })
    }

    /// Whether the user may keep consuming cloud minutes today.
    ///
    /// Only the free plan is gated, and only when enforcement is on and the
    /// deployment is not self-hosted.
    pub async fn has_remaining_quota(
        &self,
        user_id: &str,
        plan: Plan,
        limit_minutes: i64,
    ) -> Result<bool> {
        if !self.policy.enforce_daily_quota || self.policy.self_hosted || plan != Plan::Free {
            return Ok(true);
        }
        let usage = self.ensure_daily_usage(user_id, limit_minutes).await?;
        Ok(usage.remaining > 0)
    }

    /// Open a usage session. Must precede the `pending → running` transition
    /// for cloud workspaces.
    pub async fn open_usage_session(&self, workspace_id: &str, user_id: &str) -> Result<String> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO usage_sessions (id, workspace_id, user_id, started_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(user_id)
        .bind(time::now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        debug!(workspace_id, user_id, "usage session opened");
        Ok(id)
    }

    /// Close the open session for a workspace, charging ceil-minutes to the
    /// owner's daily counter. No-op when no session is open, so double-close
    /// is safe.
    pub async fn close_usage_session(
        &self,
        workspace_id: &str,
        stop_source: StopSource,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::other)?;

        let Some(row) = sqlx::query(
            "SELECT id, user_id, started_at FROM usage_sessions
             WHERE workspace_id = ? AND stopped_at IS NULL",
        )
        .bind(workspace_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::other)?
        else {
            return Ok(());
        };

        let session_id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let started_at: String = row.get("started_at");

        let now = time::now();
        let started = time::parse_rfc3339(&started_at)
            .ok_or_else(|| Error::internal("malformed session started_at"))?;
        let minutes = time::ceil_minutes(started, now);

        sqlx::query(
            "UPDATE usage_sessions
             SET stopped_at = ?, duration_minutes = ?, stop_source = ?
             WHERE id = ? AND stopped_at IS NULL",
        )
        .bind(now.to_rfc3339())
        .bind(minutes)
        .bind(stop_source.as_str())
        .bind(&session_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "INSERT INTO daily_usage (user_id, date, minutes_used) VALUES (?, ?, ?)
             ON CONFLICT (user_id, date) DO UPDATE
             SET minutes_used = minutes_used + excluded.minutes_used",
        )
        .bind(&user_id)
        .bind(time::today_utc())
        .bind(minutes)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        tx.commit().await.map_err(Error::other)?;
        info!(
            workspace_id,
            minutes,
            stop_source = stop_source.as_str(),
            "usage session closed"
        );
        Ok(())
    }

    /// All sessions for a workspace, oldest first.
    pub async fn sessions_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<UsageSessionRow>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, user_id, started_at, stopped_at, duration_minutes, stop_source
             FROM usage_sessions WHERE workspace_id = ? ORDER BY started_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(rows
            .into_iter()
            .map(|r| UsageSessionRow {
                id: r.get("id"),
                workspace_id: r.get("workspace_id"),
                user_id: r.get("user_id"),
                started_at: r.get("started_at"),
                stopped_at: r.get("stopped_at"),
                duration_minutes: r.get("duration_minutes"),
                stop_source: r.get("stop_source"),
            })
            .collect())
    }

    /// Whether a workspace currently has an open session.
    pub async fn has_open_session(&self, workspace_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM usage_sessions WHERE workspace_id = ? AND stopped_at IS NULL",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.is_some())
    }

    /// Users whose minutes today meet or exceed the limit (quota reaper input).
    pub async fn users_over_daily_limit(&self, limit_minutes: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT user_id FROM daily_usage WHERE date = ? AND minutes_used >= ?",
        )
        .bind(time::today_utc())
        .bind(limit_minutes)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }

    /// Test/ops hook: add minutes directly to today's counter.
    pub async fn add_minutes(&self, user_id: &str, minutes: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_usage (user_id, date, minutes_used) VALUES (?, ?, ?)
             ON CONFLICT (user_id, date) DO UPDATE
             SET minutes_used = minutes_used + excluded.minutes_used",
        )
        .bind(user_id)
        .bind(time::today_utc())
        .bind(minutes)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store(policy: QuotaPolicy) -> UsageStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        UsageStore::new(pool, policy).await.unwrap()
    }

    fn enforcing() -> QuotaPolicy {
        QuotaPolicy {
            enforce_daily_quota: true,
            self_hosted: false,
        }
    }

    #[tokio::test]
    async fn ensure_creates_row_once() {
        let store = store(enforcing()).await;
        let usage = store.ensure_daily_usage("user-1", 60).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 60);

        store.add_minutes("user-1", 10).await.unwrap();
        let usage = store.ensure_daily_usage("user-1", 60).await.unwrap();
        assert_eq!(usage.used, 10);
        assert_eq!(usage.remaining, 50);
    }

    #[tokio::test]
    async fn quota_gates_only_free_plan() {
        let store = store(enforcing()).await;
        store.add_minutes("user-1", 60).await.unwrap();

        assert!(!store.has_remaining_quota("user-1", Plan::Free, 60).await.unwrap());
        assert!(store.has_remaining_quota("user-1", Plan::Pro, 60).await.unwrap());
        assert!(store.has_remaining_quota("user-1", Plan::Tunnel, 60).await.unwrap());
    }

    #[tokio::test]
    async fn self_hosted_never_gates() {
        let store = store(QuotaPolicy {
            enforce_daily_quota: true,
            self_hosted: true,
        })
        .await;
        store.add_minutes("user-1", 600).await.unwrap();
        assert!(store.has_remaining_quota("user-1", Plan::Free, 60).await.unwrap());
    }

    #[tokio::test]
    async fn close_session_charges_ceil_minutes_once() {
        let store = store(enforcing()).await;
        store.open_usage_session("ws-1", "user-1").await.unwrap();
        assert!(store.has_open_session("ws-1").await.unwrap());

        store
            .close_usage_session("ws-1", StopSource::Manual)
            .await
            .unwrap();
        assert!(!store.has_open_session("ws-1").await.unwrap());

        // Anything in (0, 60s] rounds to one minute.
        let usage = store.ensure_daily_usage("user-1", 60).await.unwrap();
        assert_eq!(usage.used, 1);

        // Double-close is a no-op.
        store
            .close_usage_session("ws-1", StopSource::Idle)
            .await
            .unwrap();
        let usage = store.ensure_daily_usage("user-1", 60).await.unwrap();
        assert_eq!(usage.used, 1);
    }

    #[tokio::test]
    async fn close_without_session_is_noop() {
        let store = store(enforcing()).await;
        store
            .close_usage_session("ws-none", StopSource::Error)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn users_over_limit() {
        let store = store(enforcing()).await;
        store.add_minutes("user-1", 60).await.unwrap();
        store.add_minutes("user-2", 5).await.unwrap();

        let over = store.users_over_daily_limit(60).await.unwrap();
        assert_eq!(over, vec!["user-1".to_string()]);
    }
}
