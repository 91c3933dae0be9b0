//! SQLite-backed credential storage with encrypt-at-rest payloads.

use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    sqlx::{Row, SqlitePool},
    tracing::{info, warn},
    zeroize::Zeroizing,
};

use berth_common::{ids::new_id, time, types::AuthType};

use crate::{
    cipher::{Aes256GcmCipher, Cipher},
    error::VaultError,
    refresh::SingleFlight,
};

/// Refresh OAuth access tokens expiring within this window.
const REFRESH_WINDOW_SECS: i64 = 5 * 60;

/// Decrypted credential payload. Serialized as JSON, then encrypted with the
/// credential id as AAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialPayload {
    ApiKey {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Oauth {
        refresh: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_id: Option<String>,
    },
}

/// What the scheduler hands to the sandbox dispatcher.
pub struct RunCredential {
    pub auth_type: AuthType,
    pub token: Secret<String>,
}

/// Listing form: never exposes the secret, only the hash suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: String,
    pub provider_id: String,
    pub auth_type: AuthType,
    pub label: Option<String>,
    /// Last 8 chars of the key hash, for display.
    pub key_suffix: String,
    pub is_active: bool,
    pub last_used_at: Option<String>,
}

/// OAuth endpoints for one upstream model provider.
#[derive(Debug, Clone, Default)]
pub struct OAuthEndpoints {
    pub client_id: String,
    pub device_code_url: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

/// Encrypt-at-rest credential store for model providers.
pub struct CredentialStore {
    pool: SqlitePool,
    key: Zeroizing<[u8; 32]>,
    cipher: Aes256GcmCipher,
    http: reqwest::Client,
    endpoints: HashMap<String, OAuthEndpoints>,
    refresh_flight: SingleFlight,
}

impl CredentialStore {
    /// Create the store and its tables.
    pub async fn new(
        pool: SqlitePool,
        key: Zeroizing<[u8; 32]>,
        endpoints: HashMap<String, OAuthEndpoints>,
    ) -> Result<Self, VaultError> {
        let store = Self {
            pool,
            key,
            cipher: Aes256GcmCipher,
            http: reqwest::Client::new(),
            endpoints,
            refresh_flight: SingleFlight::new(),
        };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), VaultError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS model_providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                is_free INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (provider_id, model_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_model_credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                label TEXT,
                encrypted_payload BLOB NOT NULL,
                key_hash TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_used_at TEXT,
                oauth_expires_at INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Catalog ──────────────────────────────────────────────────────────

    /// Upsert a model provider by name; returns its id.
    pub async fn upsert_provider(&self, name: &str) -> Result<String, VaultError> {
        if let Some(row) = sqlx::query("SELECT id FROM model_providers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get("id"));
        }
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO model_providers (id, name, is_enabled, created_at, updated_at)
             VALUES (?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Upsert a model row; returns its id.
    pub async fn upsert_model(
        &self,
        provider_id: &str,
        model_id: &str,
        display_name: &str,
        is_free: bool,
    ) -> Result<String, VaultError> {
        if let Some(row) =
            sqlx::query("SELECT id FROM models WHERE provider_id = ? AND model_id = ?")
                .bind(provider_id)
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(row.get("id"));
        }
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO models (id, provider_id, model_id, display_name, is_free, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(provider_id)
        .bind(model_id)
        .bind(display_name)
        .bind(is_free)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Whether a model is free (no credential required).
    pub async fn model_is_free(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<bool, VaultError> {
        let row = sqlx::query("SELECT is_free FROM models WHERE provider_id = ? AND model_id = ?")
            .bind(provider_id)
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VaultError::NotFound)?;
        Ok(row.get::<bool, _>("is_free"))
    }

    pub async fn provider_name(&self, provider_id: &str) -> Result<String, VaultError> {
        let row = sqlx::query("SELECT name FROM model_providers WHERE id = ?")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VaultError::NotFound)?;
        Ok(row.get("name"))
    }

    // ── Write paths ──────────────────────────────────────────────────────

    /// Create or replace the single active credential per (user, provider).
    pub async fn store_api_key(
        &self,
        user_id: &str,
        provider_name: &str,
        api_key: &str,
        label: Option<&str>,
    ) -> Result<String, VaultError> {
        let payload = CredentialPayload::ApiKey {
            api_key: api_key.to_string(),
        };
        self.store_credential(user_id, provider_name, AuthType::ApiKey, &payload, label)
            .await
    }

    /// Create or replace the single active OAuth credential per (user, provider).
    pub async fn store_oauth_tokens(
        &self,
        user_id: &str,
        provider_name: &str,
        refresh: &str,
        access: Option<&str>,
        expires_at: Option<i64>,
        label: Option<&str>,
    ) -> Result<String, VaultError> {
        let payload = CredentialPayload::Oauth {
            refresh: refresh.to_string(),
            access: access.map(str::to_string),
            expires_at,
            account_id: None,
        };
        self.store_credential(user_id, provider_name, AuthType::Oauth, &payload, label)
            .await
    }

    async fn store_credential(
        &self,
        user_id: &str,
        provider_name: &str,
        auth_type: AuthType,
        payload: &CredentialPayload,
        label: Option<&str>,
    ) -> Result<String, VaultError> {
        let provider_id = self.upsert_provider(provider_name).await?;
        let id = new_id();
        let now = time::now_rfc3339();

        let secret_material = match payload {
            CredentialPayload::ApiKey { api_key } => api_key.as_str(),
            CredentialPayload::Oauth { refresh, .. } => refresh.as_str(),
        };
        let key_hash = hash_secret(secret_material);
        let oauth_expires_at = match payload {
            CredentialPayload::Oauth { expires_at, .. } => *expires_at,
            CredentialPayload::ApiKey { .. } => None,
        };
        let blob = self.encrypt_payload(&id, payload)?;

        let mut tx = self.pool.begin().await?;
        // One active credential per (user, provider): replacement deletes the
        // previous row rather than stacking inactive duplicates.
        sqlx::query(
            "DELETE FROM user_model_credentials
             WHERE user_id = ? AND provider_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .bind(&provider_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO user_model_credentials
                 (id, user_id, provider_id, auth_type, label, encrypted_payload, key_hash,
                  is_active, oauth_expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&provider_id)
        .bind(auth_type.as_str())
        .bind(label)
        .bind(&blob)
        .bind(&key_hash)
        .bind(oauth_expires_at)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(user_id, provider = provider_name, auth_type = auth_type.as_str(), "credential stored");
        Ok(id)
    }

    /// Flip `is_active` off, keeping the row for audit.
    pub async fn revoke_credential(&self, id: &str, user_id: &str) -> Result<(), VaultError> {
        let result = sqlx::query(
            "UPDATE user_model_credentials SET is_active = 0, updated_at = ?
             WHERE id = ? AND user_id = ?",
        )
        .bind(time::now_rfc3339())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Remove the row entirely.
    pub async fn delete_credential(&self, id: &str, user_id: &str) -> Result<(), VaultError> {
        let result = sqlx::query("DELETE FROM user_model_credentials WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    pub async fn list_credentials(
        &self,
        user_id: &str,
    ) -> Result<Vec<CredentialSummary>, VaultError> {
        let rows = sqlx::query(
            "SELECT id, provider_id, auth_type, label, key_hash, is_active, last_used_at
             FROM user_model_credentials WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key_hash: String = row.get("key_hash");
                let auth_type = AuthType::parse(row.get::<String, _>("auth_type").as_str())?;
                Some(CredentialSummary {
                    id: row.get("id"),
                    provider_id: row.get("provider_id"),
                    auth_type,
                    label: row.get("label"),
                    key_suffix: key_hash[key_hash.len().saturating_sub(8)..].to_string(),
                    is_active: row.get("is_active"),
                    last_used_at: row.get("last_used_at"),
                })
            })
            .collect())
    }

    /// The active credential for (user, provider), if any.
    pub async fn find_active(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<Option<String>, VaultError> {
        let row = sqlx::query(
            "SELECT id FROM user_model_credentials
             WHERE user_id = ? AND provider_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    // ── Run path ─────────────────────────────────────────────────────────

    /// Resolve a credential for a run. API keys come back verbatim; OAuth
    /// access tokens are refreshed first when missing or expiring within
    /// five minutes. Concurrent callers share at most one in-flight refresh.
    pub async fn credential_for_run(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<RunCredential, VaultError> {
        let payload = self.load_payload(credential_id, user_id).await?;

        let credential = match payload {
            CredentialPayload::ApiKey { api_key } => RunCredential {
                auth_type: AuthType::ApiKey,
                token: Secret::new(api_key),
            },
            CredentialPayload::Oauth {
                access, expires_at, ..
            } => {
                let now = time::now().timestamp();
                let fresh = access.filter(|_| {
                    expires_at.is_some_and(|exp| exp - now >= REFRESH_WINDOW_SECS)
                });
                let token = match fresh {
                    Some(token) => token,
                    None => self.refresh_oauth(credential_id, user_id).await?,
                };
                RunCredential {
                    auth_type: AuthType::Oauth,
                    token: Secret::new(token),
                }
            },
        };

        sqlx::query("UPDATE user_model_credentials SET last_used_at = ? WHERE id = ?")
            .bind(time::now_rfc3339())
            .bind(credential_id)
            .execute(&self.pool)
            .await?;

        Ok(credential)
    }

    /// Refresh an OAuth credential through the provider's token endpoint.
    /// Single-flight per credential id: the loser of the race re-reads the
    /// winner's result instead of issuing a second upstream call.
    async fn refresh_oauth(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<String, VaultError> {
        let _guard = self.refresh_flight.acquire(credential_id).await;

        // Re-read under the guard: the winner may already have refreshed.
        let payload = self.load_payload(credential_id, user_id).await?;
        let CredentialPayload::Oauth {
            refresh,
            access,
            expires_at,
            account_id,
        } = payload
        else {
            return Err(VaultError::OAuth("not an oauth credential".into()));
        };

        let now = time::now().timestamp();
        if let Some(token) = access
            && expires_at.is_some_and(|exp| exp - now >= REFRESH_WINDOW_SECS)
        {
            return Ok(token);
        }

        let provider_id = self.credential_provider(credential_id).await?;
        let provider_name = self.provider_name(&provider_id).await?;
        let endpoints = self
            .endpoints
            .get(&provider_name)
            .ok_or_else(|| VaultError::OAuth(format!("no oauth endpoints for {provider_name}")))?;

        let resp = self
            .http
            .post(&endpoints.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", endpoints.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
            ])
            .send()
            .await?;

        let body: TokenResponse = resp.json().await?;
        if let Some(err) = body.error {
            warn!(credential_id, error = %err, "oauth refresh rejected");
            return Err(VaultError::OAuth(err));
        }
        let access_token = body
            .access_token
            .ok_or_else(|| VaultError::OAuth("refresh response missing access_token".into()))?;

        let new_expires_at = body.expires_in.map(|secs| now + secs);
        let new_payload = CredentialPayload::Oauth {
            // Providers may rotate the refresh token on each refresh.
            refresh: body.refresh_token.unwrap_or(refresh),
            access: Some(access_token.clone()),
            expires_at: new_expires_at,
            account_id,
        };
        let blob = self.encrypt_payload(credential_id, &new_payload)?;
        sqlx::query(
            "UPDATE user_model_credentials
             SET encrypted_payload = ?, oauth_expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&blob)
        .bind(new_expires_at)
        .bind(time::now_rfc3339())
        .bind(credential_id)
        .execute(&self.pool)
        .await?;

        info!(credential_id, "oauth credential refreshed");
        Ok(access_token)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn encrypt_payload(
        &self,
        credential_id: &str,
        payload: &CredentialPayload,
    ) -> Result<Vec<u8>, VaultError> {
        let plaintext = serde_json::to_vec(payload)?;
        self.cipher
            .encrypt(&self.key, &plaintext, credential_id.as_bytes())
    }

    async fn load_payload(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<CredentialPayload, VaultError> {
        let row = sqlx::query(
            "SELECT encrypted_payload, is_active FROM user_model_credentials
             WHERE id = ? AND user_id = ?",
        )
        .bind(credential_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(VaultError::NotFound)?;

        if !row.get::<bool, _>("is_active") {
            return Err(VaultError::NotFound);
        }

        let blob: Vec<u8> = row.get("encrypted_payload");
        let plaintext = self
            .cipher
            .decrypt(&self.key, &blob, credential_id.as_bytes())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn credential_provider(&self, credential_id: &str) -> Result<String, VaultError> {
        let row = sqlx::query("SELECT provider_id FROM user_model_credentials WHERE id = ?")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VaultError::NotFound)?;
        Ok(row.get("provider_id"))
    }

    pub(crate) fn endpoints_for(&self, provider_name: &str) -> Option<&OAuthEndpoints> {
        self.endpoints.get(provider_name)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
