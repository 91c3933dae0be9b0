//! Periodic reaping jobs: idle stop, daily-quota stop, long-term terminate.
//!
//! A database lease guards each pass so that exactly one instance of the
//! control plane processes the queue at a time.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    chrono::Duration as ChronoDuration,
    sqlx::{Row, SqlitePool},
    tracing::{info, warn},
};

use berth_common::{Error, Result, ids::new_id, time, types::{Plan, StopSource}};
use berth_metering::{QuotaPolicy, SystemConfigKey, SystemConfigStore, UsageStore};

use crate::orchestrator::Orchestrator;

/// Cloud workspaces untouched for this long are terminated outright.
const LONG_TERM_INACTIVE_DAYS: i64 = 4;
/// Lease TTL; generously above one pass's expected duration.
const LEASE_TTL_SECS: i64 = 120;
const LEASE_NAME: &str = "workspace-reapers";

/// Resolves a user's plan; the quota reaper only stops free-plan owners.
#[async_trait]
pub trait PlanLookup: Send + Sync {
    async fn plan_for(&self, user_id: &str) -> Result<Plan>;
}

/// Database-backed advisory lease.
pub struct AdvisoryLease {
    pool: SqlitePool,
    name: String,
    holder: String,
    ttl_secs: i64,
}

impl AdvisoryLease {
    pub async fn new(pool: SqlitePool, name: &str, ttl_secs: i64) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS advisory_leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(Error::other)?;

        Ok(Self {
            pool,
            name: name.to_string(),
            holder: new_id(),
            ttl_secs,
        })
    }

    /// Take the lease unless another live holder has it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::other)?;
        let now = time::now_rfc3339();

        let current = sqlx::query("SELECT holder, expires_at FROM advisory_leases WHERE name = ?")
            .bind(&self.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::other)?;

        if let Some(row) = current {
            let holder: String = row.get("holder");
            let expires_at: String = row.get("expires_at");
            if holder != self.holder && expires_at > now {
                return Ok(false);
            }
        }

        let expires = (time::now() + ChronoDuration::seconds(self.ttl_secs)).to_rfc3339();
        sqlx::query(
            "INSERT INTO advisory_leases (name, holder, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
        )
        .bind(&self.name)
        .bind(&self.holder)
        .bind(&expires)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        tx.commit().await.map_err(Error::other)?;
        Ok(true)
    }

    pub async fn release(&self) -> Result<()> {
        sqlx::query("DELETE FROM advisory_leases WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await
            .map_err(Error::other)?;
        Ok(())
    }
}

pub struct Reapers {
    orchestrator: Arc<Orchestrator>,
    usage: Arc<UsageStore>,
    system_config: Arc<SystemConfigStore>,
    plans: Arc<dyn PlanLookup>,
    policy: QuotaPolicy,
    lease: AdvisoryLease,
}

impl Reapers {
    pub async fn new(
        orchestrator: Arc<Orchestrator>,
        usage: Arc<UsageStore>,
        system_config: Arc<SystemConfigStore>,
        plans: Arc<dyn PlanLookup>,
        policy: QuotaPolicy,
        pool: SqlitePool,
    ) -> Result<Self> {
        let lease = AdvisoryLease::new(pool, LEASE_NAME, LEASE_TTL_SECS).await?;
        Ok(Self {
            orchestrator,
            usage,
            system_config,
            plans,
            policy,
            lease,
        })
    }

    /// Spawn the periodic loop. The handle stops reaping when dropped.
    #[must_use]
    pub fn start(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "reaper pass failed");
                }
            }
        })
    }

    /// One full pass: idle, quota, long-term. No-op when another instance
    /// holds the lease.
    pub async fn run_once(&self) -> Result<()> {
        if !self.lease.try_acquire().await? {
            return Ok(());
        }
        let result = self.reap_all().await;
        self.lease.release().await?;
        result
    }

    async fn reap_all(&self) -> Result<()> {
        self.reap_idle().await?;
        self.reap_quota_exceeded().await?;
        self.reap_long_term_inactive().await?;
        Ok(())
    }

    /// Stop running cloud workspaces idle past `idle_timeout_minutes`.
    async fn reap_idle(&self) -> Result<()> {
        let idle_minutes = self
            .system_config
            .get(SystemConfigKey::IdleTimeoutMinutes)
            .await?;
        let cutoff = (time::now() - ChronoDuration::minutes(idle_minutes)).to_rfc3339();

        for ws in self.orchestrator.store().idle_running_cloud(&cutoff).await? {
            info!(workspace_id = %ws.id, "idle reaper stopping workspace");
            if let Err(e) = self
                .orchestrator
                .stop_internal(&ws.id, StopSource::Idle)
                .await
            {
                warn!(workspace_id = %ws.id, error = %e, "idle stop failed");
            }
        }
        Ok(())
    }

    /// Stop running cloud workspaces of free-plan users who exhausted today's
    /// minutes.
    async fn reap_quota_exceeded(&self) -> Result<()> {
        if !self.policy.enforce_daily_quota || self.policy.self_hosted {
            return Ok(());
        }
        let limit = self
            .system_config
            .get(SystemConfigKey::FreeTierDailyMinutes)
            .await?;

        let over = self.usage.users_over_daily_limit(limit).await?;
        if over.is_empty() {
            return Ok(());
        }

        let mut gated = Vec::new();
        for user_id in over {
            if self.plans.plan_for(&user_id).await? == Plan::Free {
                gated.push(user_id);
            }
        }

        for ws in self
            .orchestrator
            .store()
            .running_cloud_for_users(&gated)
            .await?
        {
            info!(workspace_id = %ws.id, "quota reaper stopping workspace");
            if let Err(e) = self
                .orchestrator
                .stop_internal(&ws.id, StopSource::QuotaExhausted)
                .await
            {
                warn!(workspace_id = %ws.id, error = %e, "quota stop failed");
            }
        }
        Ok(())
    }

    /// Terminate cloud workspaces (running or stopped) inactive for four days.
    async fn reap_long_term_inactive(&self) -> Result<()> {
        let cutoff = (time::now() - ChronoDuration::days(LONG_TERM_INACTIVE_DAYS)).to_rfc3339();

        for ws in self
            .orchestrator
            .store()
            .long_term_inactive_cloud(&cutoff)
            .await?
        {
            info!(workspace_id = %ws.id, "terminating long-term inactive workspace");
            if let Err(e) = self
                .orchestrator
                .terminate_internal(&ws.id, StopSource::Idle)
                .await
            {
                warn!(workspace_id = %ws.id, error = %e, "long-term terminate failed");
            }
        }
        Ok(())
    }

}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_excluded_until_release() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let first = AdvisoryLease::new(pool.clone(), "test", 60).await.unwrap();
        let second = AdvisoryLease::new(pool, "test", 60).await.unwrap();

        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());
        // Re-entrant for the same holder.
        assert!(first.try_acquire().await.unwrap());

        first.release().await.unwrap();
        assert!(second.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_stealable() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let stale = AdvisoryLease::new(pool.clone(), "test", -1).await.unwrap();
        let fresh = AdvisoryLease::new(pool, "test", 60).await.unwrap();

        assert!(stale.try_acquire().await.unwrap());
        assert!(fresh.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn release_only_removes_own_lease() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let first = AdvisoryLease::new(pool.clone(), "test", 60).await.unwrap();
        let second = AdvisoryLease::new(pool, "test", 60).await.unwrap();

        assert!(first.try_acquire().await.unwrap());
        second.release().await.unwrap();
        assert!(!second.try_acquire().await.unwrap());
    }
}
