/// Refresh token records as persisted in `refresh_tokens`
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub jti: String,
    pub user_id: Uuid,
    /// SHA-256 of the raw token; the token itself is never stored
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRecord {
    /// Not revoked and not expired at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && self.expires_at > now
    }
}

/// Everything needed to insert a refresh token record
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: Uuid,
    pub jti: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
}

impl NewRefreshToken {
    pub fn into_record(self, created_at: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            jti: self.jti,
            user_id: self.user_id,
            token_hash: self.token_hash,
            expires_at: self.expires_at,
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            device_fingerprint: self.device_fingerprint,
            created_at,
            last_used_at: None,
        }
    }
}

/// A token identifier revoked in bulk, with its natural expiry so the
/// revocation list knows how long to remember it
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RevokedToken {
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Rotated,
    Logout,
    LogoutAll,
    ReuseDetected,
    PasswordChange,
    Admin,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::Admin => "admin",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex-encoded SHA-256 of a raw token
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
