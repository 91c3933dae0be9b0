//! Vault error types.

/// Errors produced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No credential stored for the requested user/provider pair.
    #[error("credential not found")]
    NotFound,

    /// A non-free model requires a credential and none is active.
    #[error("credential required for provider {0}")]
    CredentialRequired(String),

    /// Encryption or decryption failed (tampered data, wrong key).
    #[error("cipher error: {0}")]
    CipherError(String),

    /// The upstream OAuth endpoint rejected a refresh or poll.
    #[error("oauth error: {0}")]
    OAuth(String),

    /// The device-code flow session is unknown or expired.
    #[error("device flow expired")]
    FlowExpired,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failure talking to the provider.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error wrapper.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<VaultError> for berth_common::Error {
    fn from(value: VaultError) -> Self {
        match value {
            VaultError::NotFound => berth_common::Error::not_found("credential not found"),
            VaultError::CredentialRequired(provider) => berth_common::Error::bad_request(format!(
                "credential required for provider {provider}"
            )),
            VaultError::FlowExpired => berth_common::Error::bad_request("device flow expired"),
            VaultError::OAuth(msg) => {
                berth_common::Error::upstream(format!("oauth endpoint: {msg}"))
            },
            VaultError::Http(e) => berth_common::Error::upstream(format!("oauth endpoint: {e}")),
            other => berth_common::Error::internal(other.to_string()),
        }
    }
}
