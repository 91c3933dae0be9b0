//! Dynamic system configuration with an in-process read cache.
//!
//! Two keys exist. Values are validated on write and cached for 60 seconds;
//! admin writes invalidate the cache immediately in this process.

use std::time::{Duration, Instant};

use {
    sqlx::{Row, SqlitePool},
    tokio::sync::RwLock,
};

use berth_common::{Error, Result};

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemConfigKey {
    IdleTimeoutMinutes,
    FreeTierDailyMinutes,
}

impl SystemConfigKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeoutMinutes => "idle_timeout_minutes",
            Self::FreeTierDailyMinutes => "free_tier_daily_minutes",
        }
    }

    #[must_use]
    pub fn default_value(self) -> i64 {
        match self {
            Self::IdleTimeoutMinutes => 30,
            Self::FreeTierDailyMinutes => 60,
        }
    }

    #[must_use]
    pub fn bounds(self) -> (i64, i64) {
        match self {
            Self::IdleTimeoutMinutes => (5, 120),
            Self::FreeTierDailyMinutes => (0, 1440),
        }
    }
}

struct CachedValue {
    value: i64,
    read_at: Instant,
}

pub struct SystemConfigStore {
    pool: SqlitePool,
    idle_timeout: RwLock<Option<CachedValue>>,
    free_tier: RwLock<Option<CachedValue>>,
}

impl SystemConfigStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS system_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(Error::other)?;

        Ok(Self {
            pool,
            idle_timeout: RwLock::new(None),
            free_tier: RwLock::new(None),
        })
    }

    fn cache_for(&self, key: SystemConfigKey) -> &RwLock<Option<CachedValue>> {
        match key {
            SystemConfigKey::IdleTimeoutMinutes => &self.idle_timeout,
            SystemConfigKey::FreeTierDailyMinutes => &self.free_tier,
        }
    }

    /// Read through the cache.
    pub async fn get(&self, key: SystemConfigKey) -> Result<i64> {
        {
            let cache = self.cache_for(key).read().await;
            if let Some(cached) = cache.as_ref()
                && cached.read_at.elapsed() < CACHE_TTL
            {
                return Ok(cached.value);
            }
        }

        let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::other)?;

        let value = row
            .and_then(|r| r.get::<String, _>("value").parse::<i64>().ok())
            .unwrap_or_else(|| key.default_value());

        *self.cache_for(key).write().await = Some(CachedValue {
            value,
            read_at: Instant::now(),
        });
        Ok(value)
    }

    /// Admin write. Rejects out-of-bounds values and invalidates the cache.
    pub async fn set(&self, key: SystemConfigKey, value: i64) -> Result<()> {
        let (min, max) = key.bounds();
        if value < min || value > max {
            return Err(Error::bad_request(format!(
                "{} must be between {min} and {max}",
                key.as_str()
            )));
        }

        sqlx::query(
            "INSERT INTO system_config (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key.as_str())
        .bind(value.to_string())
        .bind(berth_common::time::now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        *self.cache_for(key).write().await = None;
        Ok(())
    }
}
