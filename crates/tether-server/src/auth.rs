//! Bearer token verification.
//!
//! Tokens are HS256 JWTs issued by the CRM's identity provider. The `sub`
//! claim names the user; which operator identities that user may drive is
//! decided later by the gateway's authorizer.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tether_session::Caller;
use tether_settings::AuthSettings;
use tracing::{debug, error};

use crate::errors::ApiError;

/// Claims read from a bearer token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// Verifies bearer tokens against the shared secret.
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for `secret`. With no secret every request fails with a
    /// configuration error.
    #[must_use]
    pub fn new(secret: Option<&str>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        Self {
            key: secret
                .filter(|s| !s.is_empty())
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    /// Verifier built from the `auth` settings section.
    #[must_use]
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.jwt_secret.as_deref(), settings.leeway_secs)
    }

    /// Decode `token` into the calling user.
    pub fn verify(&self, token: &str) -> Result<Caller, ApiError> {
        let Some(key) = &self.key else {
            error!("jwt secret not configured");
            return Err(ApiError::Configuration);
        };
        let data = decode::<Claims>(token, key, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            ApiError::Unauthenticated("Invalid token".into())
        })?;
        if data.claims.sub.is_empty() {
            return Err(ApiError::Unauthenticated("Invalid token".into()));
        }
        Ok(Caller::new(data.claims.sub))
    }

    /// Authenticate a request from its `Authorization` header, falling back
    /// to a `token` query parameter (browsers cannot set headers on a
    /// `WebSocket` upgrade).
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Caller, ApiError> {
        if self.key.is_none() {
            error!("jwt secret not configured");
            return Err(ApiError::Configuration);
        }
        let token = bearer_token(headers)
            .or(query_token)
            .ok_or_else(|| ApiError::Unauthenticated("Authorization required".into()))?;
        self.verify(token)
    }
}

/// Token from an `Authorization: Bearer …` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
