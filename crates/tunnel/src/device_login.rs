//! Device-code login for tunnel agents.
//!
//! An agent obtains a `(device_code, user_code)` pair, the user approves the
//! `user_code` in the browser, the agent polls until approval, then exchanges
//! the device code — atomically, single use — for a long-lived agent token.
//!
//! Sessions live in a shared key-value store behind [`DeviceCodeStore`]; a
//! SQLite implementation backs multi-instance deployments and an in-memory
//! one backs tests.

use {
    async_trait::async_trait,
    dashmap::DashMap,
    rand::Rng,
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool},
    tracing::info,
};

use berth_common::{Error, Result, ids::new_id, time};
use berth_protocol::{DEVICE_CODE_TTL_SECS, DEVICE_POLL_MIN_SECS, TokenKeys};

/// Characters for user codes; ambiguous glyphs excluded.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSessionStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl DeviceSessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "approved" => Self::Approved,
            "denied" => Self::Denied,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub device_code: String,
    pub user_code: String,
    pub status: DeviceSessionStatus,
    pub user_id: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

impl DeviceSession {
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Storage seam for device-code sessions.
#[async_trait]
pub trait DeviceCodeStore: Send + Sync {
    async fn insert(&self, session: &DeviceSession) -> Result<()>;
    async fn get(&self, device_code: &str) -> Result<Option<DeviceSession>>;
    async fn get_by_user_code(&self, user_code: &str) -> Result<Option<DeviceSession>>;
    async fn set_status(
        &self,
        device_code: &str,
        status: DeviceSessionStatus,
        user_id: Option<&str>,
    ) -> Result<()>;
    /// Atomically remove and return the session iff it is approved.
    async fn take_approved(&self, device_code: &str) -> Result<Option<DeviceSession>>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryDeviceCodeStore {
    sessions: DashMap<String, DeviceSession>,
}

impl MemoryDeviceCodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceCodeStore for MemoryDeviceCodeStore {
    async fn insert(&self, session: &DeviceSession) -> Result<()> {
        self.sessions
            .insert(session.device_code.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, device_code: &str) -> Result<Option<DeviceSession>> {
        Ok(self.sessions.get(device_code).map(|s| s.clone()))
    }

    async fn get_by_user_code(&self, user_code: &str) -> Result<Option<DeviceSession>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.user_code == user_code)
            .map(|s| s.clone()))
    }

    async fn set_status(
        &self,
        device_code: &str,
        status: DeviceSessionStatus,
        user_id: Option<&str>,
    ) -> Result<()> {
        if let Some(mut session) = self.sessions.get_mut(device_code) {
            session.status = status;
            if let Some(user_id) = user_id {
                session.user_id = Some(user_id.to_string());
            }
        }
        Ok(())
    }

    async fn take_approved(&self, device_code: &str) -> Result<Option<DeviceSession>> {
        Ok(self
            .sessions
            .remove_if(device_code, |_, s| s.status == DeviceSessionStatus::Approved)
            .map(|(_, s)| s))
    }
}

// ── SQLite store ─────────────────────────────────────────────────────────────

pub struct SqliteDeviceCodeStore {
    pool: SqlitePool,
}

impl SqliteDeviceCodeStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS device_code_sessions (
                device_code TEXT PRIMARY KEY,
                user_code TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                user_id TEXT,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(Error::other)?;
        Ok(Self { pool })
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> DeviceSession {
        DeviceSession {
            device_code: row.get("device_code"),
            user_code: row.get("user_code"),
            status: DeviceSessionStatus::parse(&row.get::<String, _>("status")),
            user_id: row.get("user_id"),
            expires_at: row.get("expires_at"),
        }
    }
}

#[async_trait]
impl DeviceCodeStore for SqliteDeviceCodeStore {
    async fn insert(&self, session: &DeviceSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_code_sessions (device_code, user_code, status, user_id, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.device_code)
        .bind(&session.user_code)
        .bind(session.status.as_str())
        .bind(&session.user_id)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    async fn get(&self, device_code: &str) -> Result<Option<DeviceSession>> {
        let row = sqlx::query(
            "SELECT device_code, user_code, status, user_id, expires_at
             FROM device_code_sessions WHERE device_code = ?",
        )
        .bind(device_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.as_ref().map(Self::row_to_session))
    }

    async fn get_by_user_code(&self, user_code: &str) -> Result<Option<DeviceSession>> {
        let row = sqlx::query(
            "SELECT device_code, user_code, status, user_id, expires_at
             FROM device_code_sessions WHERE user_code = ?",
        )
        .bind(user_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(row.as_ref().map(Self::row_to_session))
    }

    async fn set_status(
        &self,
        device_code: &str,
        status: DeviceSessionStatus,
        user_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE device_code_sessions
             SET status = ?, user_id = COALESCE(?, user_id)
             WHERE device_code = ?",
        )
        .bind(status.as_str())
        .bind(user_id)
        .bind(device_code)
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    async fn take_approved(&self, device_code: &str) -> Result<Option<DeviceSession>> {
        let mut tx = self.pool.begin().await.map_err(Error::other)?;
        let row = sqlx::query(
            "SELECT device_code, user_code, status, user_id, expires_at
             FROM device_code_sessions WHERE device_code = ? AND status = 'approved'",
        )
        .bind(device_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::other)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let session = Self::row_to_session(&row);

        sqlx::query("DELETE FROM device_code_sessions WHERE device_code = ?")
            .bind(device_code)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;
        tx.commit().await.map_err(Error::other)?;
        Ok(Some(session))
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StartedLogin {
    pub device_code: String,
    pub user_code: String,
    /// Seconds between polls the agent must respect.
    pub interval: u64,
    pub expires_in: i64,
}

pub struct DeviceLoginBroker<S: DeviceCodeStore> {
    store: S,
}

impl<S: DeviceCodeStore> DeviceLoginBroker<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Open a login session with a 10-minute TTL.
    pub async fn start(&self) -> Result<StartedLogin> {
        let session = DeviceSession {
            device_code: new_id(),
            user_code: generate_user_code(),
            status: DeviceSessionStatus::Pending,
            user_id: None,
            expires_at: time::now().timestamp() + DEVICE_CODE_TTL_SECS,
        };
        self.store.insert(&session).await?;
        info!(user_code = %session.user_code, "device login started");
        Ok(StartedLogin {
            device_code: session.device_code,
            user_code: session.user_code,
            interval: DEVICE_POLL_MIN_SECS,
            expires_in: DEVICE_CODE_TTL_SECS,
        })
    }

    /// The browser-side approval, bound to the signed-in user.
    pub async fn approve(&self, user_code: &str, user_id: &str) -> Result<()> {
        self.resolve_user_code(user_code, DeviceSessionStatus::Approved, Some(user_id))
            .await
    }

    pub async fn deny(&self, user_code: &str) -> Result<()> {
        self.resolve_user_code(user_code, DeviceSessionStatus::Denied, None)
            .await
    }

    async fn resolve_user_code(
        &self,
        user_code: &str,
        status: DeviceSessionStatus,
        user_id: Option<&str>,
    ) -> Result<()> {
        let session = self
            .store
            .get_by_user_code(user_code)
            .await?
            .ok_or_else(|| Error::not_found("unknown code"))?;
        if session.is_expired(time::now().timestamp()) {
            return Err(Error::bad_request("code expired"));
        }
        if session.status != DeviceSessionStatus::Pending {
            return Err(Error::bad_request("code already used"));
        }
        self.store
            .set_status(&session.device_code, status, user_id)
            .await
    }

    /// Agent-side poll. Expiry is decided lazily against the stored TTL.
    pub async fn poll(&self, device_code: &str) -> Result<DeviceSessionStatus> {
        let session = self
            .store
            .get(device_code)
            .await?
            .ok_or_else(|| Error::not_found("unknown device code"))?;
        if session.status == DeviceSessionStatus::Pending
            && session.is_expired(time::now().timestamp())
        {
            self.store
                .set_status(device_code, DeviceSessionStatus::Expired, None)
                .await?;
            return Ok(DeviceSessionStatus::Expired);
        }
        Ok(session.status)
    }

    /// Consume an approved session and mint the 30-day agent token.
    pub async fn exchange(&self, device_code: &str, keys: &TokenKeys) -> Result<String> {
        let session = self
            .store
            .take_approved(device_code)
            .await?
            .ok_or_else(|| Error::bad_request("device code is not approved"))?;
        let user_id = session
            .user_id
            .ok_or_else(|| Error::internal("approved session without user"))?;
        info!(user_id = %user_id, "device login exchanged for agent token");
        keys.mint_agent(&user_id)
    }
}

fn generate_user_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.random_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new(b"test-secret-at-least-32-bytes-long!!")
    }

    #[test]
    fn user_codes_have_shape() {
        let code = generate_user_code();
        assert_eq!(code.len(), 9);
        assert_eq!(code.chars().nth(4), Some('-'));
        assert_ne!(generate_user_code(), generate_user_code());
    }

    #[tokio::test]
    async fn full_flow_memory() {
        let broker = DeviceLoginBroker::new(MemoryDeviceCodeStore::new());
        let login = broker.start().await.unwrap();
        assert_eq!(login.interval, 5);

        assert_eq!(
            broker.poll(&login.device_code).await.unwrap(),
            DeviceSessionStatus::Pending
        );

        broker.approve(&login.user_code, "user-1").await.unwrap();
        assert_eq!(
            broker.poll(&login.device_code).await.unwrap(),
            DeviceSessionStatus::Approved
        );

        let token = broker.exchange(&login.device_code, &keys()).await.unwrap();
        let claims = keys().verify_agent(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");

        // The session is consumed: a second exchange fails.
        assert!(broker.exchange(&login.device_code, &keys()).await.is_err());
    }

    #[tokio::test]
    async fn full_flow_sqlite() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let broker = DeviceLoginBroker::new(SqliteDeviceCodeStore::new(pool).await.unwrap());

        let login = broker.start().await.unwrap();
        broker.approve(&login.user_code, "user-7").await.unwrap();
        let token = broker.exchange(&login.device_code, &keys()).await.unwrap();
        assert_eq!(keys().verify_agent(&token).unwrap().user_id, "user-7");
        assert!(broker.exchange(&login.device_code, &keys()).await.is_err());
    }

    #[tokio::test]
    async fn denial_blocks_exchange() {
        let broker = DeviceLoginBroker::new(MemoryDeviceCodeStore::new());
        let login = broker.start().await.unwrap();

        broker.deny(&login.user_code).await.unwrap();
        assert_eq!(
            broker.poll(&login.device_code).await.unwrap(),
            DeviceSessionStatus::Denied
        );
        assert!(broker.exchange(&login.device_code, &keys()).await.is_err());

        // A settled code cannot be re-approved.
        assert!(broker.approve(&login.user_code, "user-1").await.is_err());
    }

    #[tokio::test]
    async fn pending_session_expires_lazily() {
        let store = MemoryDeviceCodeStore::new();
        let session = DeviceSession {
            device_code: "dc-1".into(),
            user_code: "AAAA-BBBB".into(),
            status: DeviceSessionStatus::Pending,
            user_id: None,
            expires_at: time::now().timestamp() - 1,
        };
        store.insert(&session).await.unwrap();

        let broker = DeviceLoginBroker::new(store);
        assert_eq!(
            broker.poll("dc-1").await.unwrap(),
            DeviceSessionStatus::Expired
        );
        assert!(broker.approve("AAAA-BBBB", "user-1").await.is_err());
    }
}
