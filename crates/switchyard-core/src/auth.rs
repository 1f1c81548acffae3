//! Token verification seam.
//!
//! The gateway resolves bearer tokens through an [`Authenticator`]; the core
//! only ever sees the verified [`Identity`].

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// A verified user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Token verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is malformed or its signature does not verify.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token has expired.
    #[error("Token expired")]
    Expired,

    /// Token verified but lacks the identity claims.
    #[error("Missing claim: {0}")]
    MissingClaim(&'static str),

    /// The verifier itself failed.
    #[error("Authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Resolves bearer tokens to identities.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a token.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Accepts tokens of the form `<uuid>:<username>`.
///
/// Intended for tests and local development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAuthenticator;

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (id, username) = token
            .split_once(':')
            .ok_or_else(|| AuthError::InvalidToken("expected <uuid>:<username>".into()))?;
        let user_id = Uuid::parse_str(id).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if username.is_empty() {
            return Err(AuthError::MissingClaim("username"));
        }
        Ok(Identity::new(user_id, username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let id = Uuid::new_v4();
        let identity = StaticAuthenticator
            .verify(&format!("{id}:alice"))
            .await
            .unwrap();
        assert_eq!(identity, Identity::new(id, "alice"));

        assert!(StaticAuthenticator.verify("garbage").await.is_err());
        assert!(StaticAuthenticator.verify(&format!("{id}:")).await.is_err());
    }
}
