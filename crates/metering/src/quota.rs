//! Monthly run quotas, materialized lazily per user.

use {
    chrono::Months,
    serde::Serialize,
    sqlx::{Row, SqlitePool},
    tracing::info,
};

use berth_common::{Error, Result, time, types::Plan};

#[derive(Debug, Clone, Serialize)]
pub struct RunQuota {
    pub user_id: String,
    pub plan: Plan,
    pub monthly_runs: i64,
    pub extra_runs: i64,
    pub next_monthly_reset_at: String,
}

impl RunQuota {
    #[must_use]
    pub fn available(&self) -> i64 {
        self.monthly_runs + self.extra_runs
    }
}

pub struct RunQuotaStore {
    pool: SqlitePool,
}

impl RunQuotaStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_loop_run_quotas (
                user_id TEXT PRIMARY KEY,
                plan TEXT NOT NULL,
                monthly_runs INTEGER NOT NULL,
                extra_runs INTEGER NOT NULL DEFAULT 0,
                next_monthly_reset_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(Error::other)?;
        Ok(Self { pool })
    }

    /// Load the user's quota, materializing it with the plan's monthly grant
    /// on first call and rolling the counter over when the reset time has
    /// passed.
    pub async fn ensure(&self, user_id: &str, plan: Plan, monthly_grant: i64) -> Result<RunQuota> {
        let now = time::now();

        let existing = sqlx::query(
            "SELECT plan, monthly_runs, extra_runs, next_monthly_reset_at
             FROM user_loop_run_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;

        let Some(row) = existing else {
            let next_reset = now + Months::new(1);
            sqlx::query(
                "INSERT INTO user_loop_run_quotas
                     (user_id, plan, monthly_runs, extra_runs, next_monthly_reset_at)
                 VALUES (?, ?, ?, 0, ?)",
            )
            .bind(user_id)
            .bind(plan.as_str())
            .bind(monthly_grant)
            .bind(next_reset.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;

            return Ok(RunQuota {
                user_id: user_id.to_string(),
                plan,
                monthly_runs: monthly_grant,
                extra_runs: 0,
                next_monthly_reset_at: next_reset.to_rfc3339(),
            });
        };

        let monthly_runs: i64 = row.get("monthly_runs");
        let extra_runs: i64 = row.get("extra_runs");
        let reset_at: String = row.get("next_monthly_reset_at");
        let reset = time::parse_rfc3339(&reset_at)
            .ok_or_else(|| Error::internal("malformed quota reset timestamp"))?;

        if now < reset {
            return Ok(RunQuota {
                user_id: user_id.to_string(),
                plan,
                monthly_runs,
                extra_runs,
                next_monthly_reset_at: reset_at,
            });
        }

        // Roll over: restore the monthly grant, keep extras, and advance the
        // pointer month by month so the anchor day is preserved.
        let mut next_reset = reset;
        while next_reset <= now {
            next_reset = next_reset + Months::new(1);
        }
        sqlx::query(
            "UPDATE user_loop_run_quotas
             SET plan = ?, monthly_runs = ?, next_monthly_reset_at = ?
             WHERE user_id = ?",
        )
        .bind(plan.as_str())
        .bind(monthly_grant)
        .bind(next_reset.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        info!(user_id, monthly_grant, "monthly run quota rolled over");
        Ok(RunQuota {
            user_id: user_id.to_string(),
            plan,
            monthly_runs: monthly_grant,
            extra_runs,
            next_monthly_reset_at: next_reset.to_rfc3339(),
        })
    }

    /// Runs currently available, without rollover. Zero when the row has not
    /// been materialized yet (callback paths have no plan context to roll
    /// over with).
    pub async fn available(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT monthly_runs, extra_runs FROM user_loop_run_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row
            .map(|r| r.get::<i64, _>("monthly_runs") + r.get::<i64, _>("extra_runs"))
            .unwrap_or(0))
    }

    /// Debit one run, consuming monthly runs before extras. Returns `false`
    /// without changes when nothing is left.
    pub async fn debit_run(&self, user_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::other)?;

        let Some(row) = sqlx::query(
            "SELECT monthly_runs, extra_runs FROM user_loop_run_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::other)?
        else {
            return Ok(false);
        };

        let monthly: i64 = row.get("monthly_runs");
        let extra: i64 = row.get("extra_runs");
        let (new_monthly, new_extra) = if monthly > 0 {
            (monthly - 1, extra)
        } else if extra > 0 {
            (monthly, extra - 1)
        } else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE user_loop_run_quotas SET monthly_runs = ?, extra_runs = ? WHERE user_id = ?",
        )
        .bind(new_monthly)
        .bind(new_extra)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        tx.commit().await.map_err(Error::other)?;
        Ok(true)
    }

    /// Top up extra runs (billing/support path).
    pub async fn add_extra_runs(&self, user_id: &str, count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE user_loop_run_quotas SET extra_runs = extra_runs + ? WHERE user_id = ?",
        )
        .bind(count)
        .bind(user_id)
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

    async fn store() -> RunQuotaStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        RunQuotaStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn materializes_on_first_call() {
        let store = store().await;
        let quota = store.ensure("user-1", Plan::Free, 30).await.unwrap();
        assert_eq!(quota.monthly_runs, 30);
        assert_eq!(quota.extra_runs, 0);
        assert_eq!(quota.available(), 30);
    }

    #[tokio::test]
    async fn debit_consumes_monthly_then_extra() {
        let store = store().await;
        store.ensure("user-1", Plan::Free, 1).await.unwrap();
        store.add_extra_runs("user-1", 1).await.unwrap();

        assert!(store.debit_run("user-1").await.unwrap());
        let quota = store.ensure("user-1", Plan::Free, 1).await.unwrap();
        assert_eq!(quota.monthly_runs, 0);
        assert_eq!(quota.extra_runs, 1);

        assert!(store.debit_run("user-1").await.unwrap());
        assert!(!store.debit_run("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn rollover_restores_grant_and_keeps_extras() {
        let store = store().await;
        store.ensure("user-1", Plan::Free, 30).await.unwrap();
        store.add_extra_runs("user-1", 5).await.unwrap();

        // Exhaust the monthly grant and backdate the reset pointer.
        for _ in 0..30 {
            assert!(store.debit_run("user-1").await.unwrap());
        }
        let past = (time::now() - chrono::Duration::days(40)).to_rfc3339();
        sqlx::query("UPDATE user_loop_run_quotas SET next_monthly_reset_at = ? WHERE user_id = ?")
            .bind(&past)
            .bind("user-1")
            .execute(&store.pool)
            .await
            .unwrap();

        let quota = store.ensure("user-1", Plan::Free, 30).await.unwrap();
        assert_eq!(quota.monthly_runs, 30);
        assert_eq!(quota.extra_runs, 5);
        assert!(time::parse_rfc3339(&quota.next_monthly_reset_at).unwrap() > time::now());
    }

    #[tokio::test]
    async fn debit_without_row_is_false() {
        let store = store().await;
        assert!(!store.debit_run("missing").await.unwrap());
    }
}
