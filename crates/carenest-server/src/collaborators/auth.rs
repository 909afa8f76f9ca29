//! Access-token verification.

use std::time::Duration;

use async_trait::async_trait;
use carenest_core::{AuthError, UserId};
use carenest_settings::AuthSettings;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Verifies a client's access token and yields the user it was issued to.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Verify `token`.
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// JWT claims accepted by [`JwtAuthValidator`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    /// Issued-at, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 JWT validator.
pub struct JwtAuthValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthValidator {
    /// Validator for tokens signed with `secret`.
    pub fn new(secret: &[u8], leeway_secs: u64, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Validator configured from settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            settings.jwt_secret.as_bytes(),
            settings.leeway_secs,
            settings.issuer.as_deref(),
        )
    }
}

#[async_trait]
impl AuthValidator for JwtAuthValidator {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        )?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }
        Ok(UserId::from(data.claims.sub))
    }
}

/// Sign an HS256 token for `user_id` valid for `ttl`.
pub fn issue_token(
    secret: &[u8],
    user_id: &UserId,
    ttl: Duration,
    issuer: Option<&str>,
) -> Result<String, AuthError> {
    let now = jsonwebtoken::get_current_timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + ttl.as_secs(),
        iat: Some(now),
        iss: issuer.map(str::to_string),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}
