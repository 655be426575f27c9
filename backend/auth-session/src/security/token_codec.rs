/// Stateless signing and verification of access and refresh tokens
///
/// ## Wire format
///
/// Compact JWS (`header.payload.signature`, base64url) signed with HS256.
/// Payload: `{sub, iat, exp, jti?, sid?, type}`.
///
/// ## Security Design
///
/// - **HS256 only**: any other `alg`, including `none`, is rejected
/// - **Type is always checked**: an access token is never accepted where a
///   refresh token is required, and vice versa
/// - **Separate secrets**: access and refresh tokens may be signed with
///   different keys
/// - **Expiry against the injected clock**: `exp > now` is checked explicitly
///   so verification is a pure function of the secret, the token and `now`
use crate::config::TokenSettings;
use crate::error::{AuthError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Access => f.write_str("access"),
            TokenType::Refresh => f.write_str("refresh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiration time (Unix seconds)
    pub exp: i64,
    /// Token identifier, the revocation and rotation key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// jti of the refresh token this access token was issued alongside
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The jti, which every refresh token must carry
    pub fn require_jti(&self) -> Result<&str> {
        self.jti.as_deref().ok_or(AuthError::MalformedToken)
    }
}

/// A freshly signed refresh token and the identifiers it was bound to
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenCodec {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(settings: &TokenSettings) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(settings.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(settings.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(settings.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(settings.refresh_secret.as_bytes()),
            access_ttl: settings.access_ttl(),
            refresh_ttl: settings.refresh_ttl(),
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Access token with no session binding
    pub fn create_access_token(&self, subject: &str, now: DateTime<Utc>) -> Result<String> {
        self.sign_access(subject, None, now)
    }

    /// Access token bound to the refresh token `session_jti`, so revoking that
    /// jti also revokes this access token
    pub fn create_session_access_token(
        &self,
        subject: &str,
        session_jti: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.sign_access(subject, Some(session_jti.to_string()), now)
    }

    /// Refresh token with a fresh random jti
    pub fn create_refresh_token(&self, subject: &str, now: DateTime<Utc>) -> Result<IssuedToken> {
        self.create_refresh_token_with_jti(subject, Uuid::new_v4().to_string(), now)
    }

    pub fn create_refresh_token_with_jti(
        &self,
        subject: &str,
        jti: String,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        let expires_at = now + self.refresh_ttl;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Some(jti.clone()),
            sid: None,
            token_type: TokenType::Refresh,
        };

        let token = encode(&Header::new(JWT_ALGORITHM), &claims, &self.refresh_encoding)
            .map_err(|e| AuthError::Internal(format!("Failed to sign refresh token: {e}")))?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Verify signature, type and expiry
    pub fn verify(&self, token: &str, expected: TokenType, now: DateTime<Utc>) -> Result<Claims> {
        let claims = self.verify_ignoring_expiry(token, expected)?;

        if claims.exp <= now.timestamp() {
            return Err(AuthError::ExpiredToken);
        }

        Ok(claims)
    }

    /// Verify signature and type only. Used where an expired token is still
    /// good enough to identify what to revoke (logout).
    pub fn verify_ignoring_expiry(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let decoding = match expected {
            TokenType::Access => &self.access_decoding,
            TokenType::Refresh => &self.refresh_decoding,
        };

        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, decoding, &validation)?.claims;

        if claims.token_type != expected {
            tracing::debug!(
                expected = %expected,
                actual = %claims.token_type,
                "Rejecting token of the wrong type"
            );
            return Err(AuthError::WrongTokenType);
        }

        Ok(claims)
    }

    fn sign_access(
        &self,
        subject: &str,
        session_jti: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: Some(Uuid::new_v4().to_string()),
            sid: session_jti,
            token_type: TokenType::Access,
        };

        encode(&Header::new(JWT_ALGORITHM), &claims, &self.access_encoding)
            .map_err(|e| AuthError::Internal(format!("Failed to sign access token: {e}")))
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}
