use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

/// Message returned to callers for every authentication failure, so that a
/// client cannot tell an unknown username from a bad password or a bad token.
pub const PUBLIC_AUTH_FAILURE: &str = "Authentication failed";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Malformed token")]
    MalformedToken,

    #[error("Token expired")]
    ExpiredToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Wrong token type")]
    WrongTokenType,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Account locked until: {0}")]
    AccountLocked(DateTime<Utc>),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Duplicate token identifier")]
    DuplicateJti,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Only availability and identifier collisions are worth another attempt.
    /// Cryptographic and validation failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::StorageUnavailable(_) | AuthError::DuplicateJti)
    }

    /// True for failures that mean "please re-authenticate".
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedToken
                | AuthError::ExpiredToken
                | AuthError::InvalidSignature
                | AuthError::WrongTokenType
                | AuthError::TokenRevoked
                | AuthError::ReuseDetected
                | AuthError::InvalidCredentials
        )
    }

    /// Stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MalformedToken => "malformed_token",
            AuthError::ExpiredToken => "expired_token",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::WrongTokenType => "wrong_token_type",
            AuthError::TokenRevoked => "token_revoked",
            AuthError::ReuseDetected => "reuse_detected",
            AuthError::AccountLocked(_) => "account_locked",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::StorageUnavailable(_) => "storage_unavailable",
            AuthError::DuplicateJti => "duplicate_jti",
            AuthError::Database(_) => "database",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Message safe to hand to an external caller
    pub fn public_message(&self) -> String {
        match self {
            AuthError::AccountLocked(until) => {
                format!("Account temporarily locked until {}", until.to_rfc3339())
            }
            AuthError::StorageUnavailable(_) => "Service temporarily unavailable".to_string(),
            AuthError::DuplicateJti | AuthError::Database(_) | AuthError::Internal(_) => {
                // Don't leak internal details
                "Internal server error".to_string()
            }
            _ => PUBLIC_AUTH_FAILURE.to_string(),
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AuthError::DuplicateJti,
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => {
                tracing::warn!("Storage unavailable: {}", err);
                AuthError::StorageUnavailable(err.to_string())
            }
            _ => {
                tracing::error!("Database error: {}", err);
                AuthError::Database(err.to_string())
            }
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::InvalidKeyFormat => AuthError::InvalidSignature,
            _ => {
                tracing::debug!("Rejecting malformed token: {}", err);
                AuthError::MalformedToken
            }
        }
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        AuthError::Internal(format!("Background task failed: {}", err))
    }
}
