/// Persistence for the auth session subsystem
///
/// - `refresh_tokens`: PostgreSQL refresh token store (sqlx)
/// - `memory`: in-process refresh token store with the same semantics
/// - `principals`: read-only lookup of principals in the external user store
/// - `retry`: timeout and bounded retry applied to every store call
use crate::error::Result;
use crate::models::{NewRefreshToken, RefreshTokenRecord, RevocationReason, RevokedToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod principals;
pub mod refresh_tokens;
pub mod retry;

pub use memory::InMemoryRefreshTokenStore;
pub use principals::{PgPrincipalDirectory, PrincipalDirectory, StaticPrincipalDirectory};
pub use refresh_tokens::PgRefreshTokenStore;
pub use retry::StoreCallPolicy;

/// Durable record of issued refresh tokens.
///
/// Records are never deleted by the authentication flow; revoked and expired
/// rows stay for audit until [`RefreshTokenStore::purge_expired`] removes them.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Insert a new active record. Fails with `DuplicateJti` on collision.
    async fn issue(&self, new: NewRefreshToken, now: DateTime<Utc>) -> Result<RefreshTokenRecord>;

    /// The record for `jti` if it is neither revoked nor expired at `now`
    async fn find_active(&self, jti: &str, now: DateTime<Utc>)
        -> Result<Option<RefreshTokenRecord>>;

    /// The record for `jti` in any state
    async fn find_by_jti(&self, jti: &str) -> Result<Option<RefreshTokenRecord>>;

    /// Atomically revoke `old_jti` and insert `new`.
    ///
    /// Exactly one of several concurrent rotations of the same `old_jti`
    /// succeeds; the others fail with `ReuseDetected`. If the insert fails the
    /// old record stays active. A retry of a rotation that already committed
    /// returns the committed successor.
    async fn rotate(
        &self,
        old_jti: &str,
        new: NewRefreshToken,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord>;

    /// Revoke one record. Returns false if it was already revoked or unknown.
    async fn revoke(&self, jti: &str, reason: RevocationReason, now: DateTime<Utc>)
        -> Result<bool>;

    /// Revoke every still-active record of a user, returning what was revoked
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RevokedToken>>;

    /// Best-effort `last_used_at` update
    async fn touch(&self, jti: &str, now: DateTime<Utc>) -> Result<()>;

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenRecord>>;

    /// Delete records that expired, or were revoked, before `older_than`
    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
