//! HTTP mapping for the shared error taxonomy.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::error,
};

use berth_common::{Error, ErrorKind};

/// Wrapper so domain errors can be returned straight from handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

impl From<berth_vault::VaultError> for ApiError {
    fn from(value: berth_vault::VaultError) -> Self {
        Self(value.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden | ErrorKind::QuotaExceeded => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Internal {
            // Full detail to the log; a stable message to the caller.
            error!(error = ?self.0, "internal error");
        }
        let message = if kind == ErrorKind::Internal {
            "internal error".to_string()
        } else {
            self.0.message.clone()
        };
        (
            status_for(kind),
            Json(json!({ "error": message, "kind": kind })),
        )
            .into_response()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(status_for(ErrorKind::AuthRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::QuotaExceeded), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::UpstreamUnavailable),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn internal_errors_hide_detail() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "db path leaked");
        let response = ApiError(Error::other(io)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
