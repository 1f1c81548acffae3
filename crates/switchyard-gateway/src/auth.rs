//! HS256 JWT verification for the `IDENTIFY` handshake.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use switchyard_core::{AuthError, Authenticator, Identity};
use uuid::Uuid;

use crate::config::AuthConfig;

/// Identity carried in the `ext` claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub user_id: Uuid,
    pub username: String,
}

/// Token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub ext: Extension,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create a verifier from configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
                    AuthError::MissingClaim("iss")
                }
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if data.claims.ext.username.is_empty() {
            return Err(AuthError::MissingClaim("ext.username"));
        }

        Ok(Identity::new(data.claims.ext.user_id, data.claims.ext.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn config(issuer: Option<&str>) -> AuthConfig {
        AuthConfig {
            jwt_secret: SECRET.into(),
            issuer: issuer.map(Into::into),
            leeway_secs: 0,
        }
    }

    fn token(user_id: Uuid, username: &str, exp: u64, iss: Option<&str>, secret: &str) -> String {
        let claims = Claims {
            ext: Extension {
                user_id,
                username: username.into(),
            },
            exp,
            iss: iss.map(Into::into),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let auth = JwtAuthenticator::new(&config(None));
        let user = Uuid::new_v4();

        let identity = auth
            .verify(&token(user, "alice", now() + 600, None, SECRET))
            .await
            .unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let auth = JwtAuthenticator::new(&config(None));
        let result = auth
            .verify(&token(Uuid::new_v4(), "alice", now() - 600, None, SECRET))
            .await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let auth = JwtAuthenticator::new(&config(None));
        let result = auth
            .verify(&token(Uuid::new_v4(), "alice", now() + 600, None, "other"))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_issuer_enforced() {
        let auth = JwtAuthenticator::new(&config(Some("switchyard")));
        let user = Uuid::new_v4();

        let ok = auth
            .verify(&token(user, "alice", now() + 600, Some("switchyard"), SECRET))
            .await;
        assert!(ok.is_ok());

        let wrong = auth
            .verify(&token(user, "alice", now() + 600, Some("elsewhere"), SECRET))
            .await;
        assert!(wrong.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let auth = JwtAuthenticator::new(&config(None));
        assert!(auth.verify("not-a-jwt").await.is_err());
    }
}
