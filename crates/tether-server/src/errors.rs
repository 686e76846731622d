//! HTTP error type and its JSON response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tether_session::GatewayError;
use tracing::error;

/// Message returned for every configuration failure. Details stay in logs.
pub const CONFIGURATION_MESSAGE: &str = "Server configuration error";

/// JSON body of every error response.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: &'static str,
}

/// Errors surfaced by HTTP and `WebSocket` handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing, malformed, or expired bearer token.
    #[error("{0}")]
    Unauthenticated(String),
    /// Authenticated, but not allowed to act on the identity.
    #[error("{0}")]
    Forbidden(String),
    /// The request itself is malformed.
    #[error("{message}")]
    BadRequest {
        /// Specific error code (e.g. `INVALID_IDENTITY`).
        code: &'static str,
        /// Human-readable message.
        message: String,
    },
    /// Nothing to route the request to.
    #[error("{0}")]
    NotFound(String),
    /// At capacity; retry later.
    #[error("{0}")]
    Unavailable(String),
    /// The server lacks configuration it needs.
    #[error("{CONFIGURATION_MESSAGE}")]
    Configuration,
    /// Storage or another dependency failed.
    #[error("{message}")]
    Internal {
        /// Specific error code (e.g. `PERSISTENCE_ERROR`).
        code: &'static str,
        /// Human-readable message.
        message: String,
    },
}

impl ApiError {
    /// Shorthand for a bad request with the generic code.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: "INVALID_PARAMS",
            message: message.into(),
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "AUTHENTICATION_ERROR",
            Self::Forbidden(_) => "AUTHORIZATION_ERROR",
            Self::BadRequest { code, .. } | Self::Internal { code, .. } => *code,
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            code: self.code(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Configuration(detail) => {
                error!(detail, "gateway configuration error");
                Self::Configuration
            }
            GatewayError::Unauthorized(_) | GatewayError::NoIdentity => {
                Self::Forbidden(err.to_string())
            }
            GatewayError::AmbiguousIdentity(_) | GatewayError::InvalidIdentity(_) => {
                Self::BadRequest {
                    code: err.code(),
                    message: err.to_string(),
                }
            }
            GatewayError::Persistence(ref inner) => {
                error!(table = %inner.table, operation = ?inner.operation, error = %inner, "persistence failure");
                Self::Internal {
                    code: err.code(),
                    message: "storage unavailable".into(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use tether_core::{Identity, PersistenceError, PersistenceOperation};

    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::invalid_params("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Configuration.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn configuration_message_is_generic() {
        let err = ApiError::from(GatewayError::Configuration("jwt secret missing".into()));
        let body = err.body();
        assert_eq!(body.error, "Server configuration error");
        assert_eq!(body.code, "CONFIGURATION_ERROR");
    }

    #[test]
    fn unauthorized_identity_is_forbidden() {
        let err = ApiError::from(GatewayError::Unauthorized(Identity::from("op-1")));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");

        let err = ApiError::from(GatewayError::NoIdentity);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn identity_errors_are_bad_requests() {
        let err = ApiError::from(GatewayError::AmbiguousIdentity(2));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "IDENTITY_REQUIRED");

        let err = ApiError::from(GatewayError::InvalidIdentity("a b".into()));
        assert_eq!(err.code(), "INVALID_IDENTITY");
    }

    #[test]
    fn persistence_hides_detail() {
        let inner =
            PersistenceError::new("credentials", PersistenceOperation::Read, "disk I/O error");
        let err = ApiError::from(GatewayError::Persistence(inner));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert!(!err.to_string().contains("disk"));
    }

    #[test]
    fn body_serializes_error_and_code() {
        let json = serde_json::to_value(ApiError::Forbidden("nope".into()).body()).unwrap();
        assert_eq!(json["error"], "nope");
        assert_eq!(json["code"], "AUTHORIZATION_ERROR");
    }
}
