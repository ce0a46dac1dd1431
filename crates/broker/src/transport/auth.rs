//! Connection identity.
//!
//! The broker does not authenticate users itself. A bearer credential taken
//! from the `Authorization` header or the `?token=` query parameter is handed
//! to an [`IdentityProvider`], which answers with the caller's user id and
//! role. Requests without a resolvable identity are refused before any
//! WebSocket upgrade happens.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

/// Role of an authenticated user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May inspect broker-wide statistics.
    Admin,
    /// Regular operator.
    #[default]
    User,
}

/// A trusted caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    /// Returns true for administrators.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Resolves a bearer credential into an identity.
pub trait IdentityProvider: Send + Sync {
    /// Returns the identity behind `credential`, or `None` if it is unknown.
    fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// Identity provider backed by the `[[auth.tokens]]` table.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenProvider {
    /// Builds the token table from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    Identity {
                        user_id: t.user_id.clone(),
                        role: t.role,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    /// Adds a token.
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        self.tokens.insert(
            token.into(),
            Identity {
                user_id: user_id.into(),
                role,
            },
        );
        self
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        self.tokens.get(credential).cloned()
    }
}

/// Errors raised while establishing the caller's identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented.
    #[error("authentication required: provide Authorization: Bearer <token> or ?token=")]
    MissingCredentials,

    /// The credential is unknown.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The caller lacks the required role.
    #[error("admin role required")]
    Forbidden,

    /// No identity provider is installed.
    #[error("identity provider not configured")]
    NotConfigured,
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredentials | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::NotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            AuthError::MissingCredentials | AuthError::InvalidCredentials => {
                ErrorCode::TransportAuthRequired
            }
            AuthError::Forbidden => ErrorCode::Forbidden,
            AuthError::NotConfigured => ErrorCode::InternalError,
        }
    }
}

/// JSON body for auth failures.
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: ErrorCode,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = AuthErrorResponse {
            success: false,
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Shared handle to the installed identity provider.
pub type SharedIdentityProvider = Arc<dyn IdentityProvider>;

/// Axum extractor that requires a resolvable identity.
///
/// Expects a [`SharedIdentityProvider`] in the request extensions.
pub struct RequireIdentity(pub Identity);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireIdentity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let provider = parts
            .extensions
            .get::<SharedIdentityProvider>()
            .ok_or(AuthError::NotConfigured)?;

        let token = extract_token(parts)?;
        let identity = provider.resolve(&token).ok_or_else(|| {
            tracing::debug!("Rejected unknown credential");
            AuthError::InvalidCredentials
        })?;

        Ok(RequireIdentity(identity))
    }
}

/// Takes the credential from the `Authorization` header or the query string.
fn extract_token(parts: &Parts) -> Result<String, AuthError> {
    if let Some(value) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }

    // Browsers cannot set headers on a WebSocket upgrade.
    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("token=") {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
    }

    Err(AuthError::MissingCredentials)
}

/// Rejects callers that are not administrators.
pub fn require_admin(identity: &Identity) -> Result<(), AuthError> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}
