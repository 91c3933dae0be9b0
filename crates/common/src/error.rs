use thiserror::Error;

/// Classification of a control-plane failure, independent of which crate
/// produced it. The gateway maps each kind onto an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No valid session or token was presented.
    AuthRequired,
    /// The caller is authenticated but not allowed: ownership mismatch,
    /// plan-gated feature, concurrency cap.
    Forbidden,
    /// Entity absent; also used for already-cleaned-up external resources.
    NotFound,
    /// Malformed input, disabled catalog entry, reserved subdomain, state
    /// transition not permitted.
    BadRequest,
    /// Daily minutes or monthly runs exhausted.
    QuotaExceeded,
    /// Subdomain taken, concurrent start-run attempt.
    Conflict,
    /// User-scoped burst ceiling hit.
    RateLimited,
    /// A provider, OAuth endpoint, or Git host returned non-2xx.
    UpstreamUnavailable,
    /// Everything else. Surfaced with a stable message, never a stack.
    Internal,
}

#[derive(Error, Debug)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRequired, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    #[must_use]
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Wrap an arbitrary source error as Internal, keeping it for logs.
    #[must_use]
    pub fn other(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: "internal error".into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether a retry of an idempotent operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::UpstreamUnavailable)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved() {
        let err = Error::quota_exceeded("monthly runs exhausted");
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(err.to_string(), "monthly runs exhausted");
    }

    #[test]
    fn only_upstream_is_transient() {
        assert!(Error::upstream("deploy API 503").is_transient());
        assert!(!Error::conflict("subdomain taken").is_transient());
        assert!(!Error::internal("boom").is_transient());
    }

    #[test]
    fn other_hides_source_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "raw detail");
        let err = Error::other(io);
        assert_eq!(err.to_string(), "internal error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
