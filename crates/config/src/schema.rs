//! Config schema types (server, database, quotas, providers, secrets).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// HTTP/WS listener and public addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Base domain under which workspace subdomains are published
    /// (`<subdomain>.<base_domain>`).
    pub base_domain: String,
    /// Base URL workspaces use to call back into the control plane.
    pub public_api_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8400,
            base_domain: "berth.localhost".into(),
            public_api_url: "http://127.0.0.1:8400".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL. `sqlite::memory:` is valid for tests.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:berth.db".into(),
        }
    }
}

/// Operator-provided secrets. Typically injected via `${VAR}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Signs workspace/tunnel/agent JWTs.
    pub token_secret: String,
    /// Derives the vault's AES-256-GCM key.
    pub vault_secret: String,
    /// Shared secret for `/internal/*` RPC (`x-internal-key`).
    pub internal_key: String,
    /// Shared secret the sandbox executor presents on run callbacks.
    pub callback_secret: String,
    /// Previous callback secret, accepted during rotation windows.
    pub callback_secret_previous: Option<String>,
}

/// Quota policy knobs. The dynamic values (`idle_timeout_minutes`,
/// `free_tier_daily_minutes`) live in the `system_config` table, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Master switch for the free-plan daily minute gate.
    pub enforce_daily_quota: bool,
    /// Self-hosted deployments never enforce daily quotas.
    pub self_hosted: bool,
    /// Monthly run grants per plan, keyed by plan name.
    pub monthly_runs: HashMap<String, i64>,
    /// Accounts exempt from the 1-concurrent-workspace cap.
    pub admin_emails: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforce_daily_quota: true,
            self_hosted: false,
            monthly_runs: HashMap::from([
                ("free".to_string(), 30),
                ("tunnel".to_string(), 100),
                ("pro".to_string(), 500),
            ]),
            admin_emails: Vec::new(),
        }
    }
}

/// Connection settings for compute backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Deployment API driven by the cloud backend.
    pub cloud_api_url: String,
    pub cloud_api_token: String,
    /// Sandbox executor's dispatch endpoint.
    pub sandbox_dispatch_url: String,
    pub sandbox_api_token: String,
}

/// One upstream model provider's OAuth endpoints for the device flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub device_code_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub secrets: SecretsConfig,
    pub quotas: QuotaConfig,
    pub providers: ProvidersConfig,
    /// OAuth endpoints keyed by model-provider name.
    pub oauth_providers: HashMap<String, OAuthProviderConfig>,
}

impl BerthConfig {
    /// Monthly run grant for a plan name; zero when the plan is unknown.
    #[must_use]
    pub fn monthly_run_quota(&self, plan: &str) -> i64 {
        self.quotas.monthly_runs.get(plan).copied().unwrap_or(0)
    }

    /// Whether this email bypasses the concurrent-workspace cap.
    #[must_use]
    pub fn is_admin_email(&self, email: &str) -> bool {
        self.quotas
            .admin_emails
            .iter()
            .any(|e| e.eq_ignore_ascii_case(email))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BerthConfig::default();
        assert_eq!(cfg.server.port, 8400);
        assert_eq!(cfg.monthly_run_quota("free"), 30);
        assert_eq!(cfg.monthly_run_quota("enterprise"), 0);
        assert!(cfg.quotas.enforce_daily_quota);
    }

    #[test]
    fn admin_email_match_is_case_insensitive() {
        let mut cfg = BerthConfig::default();
        cfg.quotas.admin_emails.push("Ops@Example.com".into());
        assert!(cfg.is_admin_email("ops@example.com"));
        assert!(!cfg.is_admin_email("user@example.com"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: BerthConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [secrets]
            token_secret = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.secrets.token_secret, "abc");
        assert!(cfg.secrets.callback_secret_previous.is_none());
    }
}
