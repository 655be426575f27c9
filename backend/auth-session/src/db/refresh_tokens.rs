/// PostgreSQL refresh token store
///
/// Rotation runs in one READ COMMITTED transaction: a conditional
/// `UPDATE ... WHERE is_revoked = false` claims the old row, then the
/// successor is inserted. Two concurrent rotations of the same row serialize
/// on the row lock; the second re-evaluates the predicate after the first
/// commits, affects zero rows, and reports reuse. The UNIQUE constraint on
/// `jti` catches identifier collisions.
use super::retry::StoreCallPolicy;
use super::RefreshTokenStore;
use crate::error::{AuthError, Result};
use crate::models::{NewRefreshToken, RefreshTokenRecord, RevocationReason, RevokedToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, jti, user_id, token_hash, expires_at, is_revoked, revoked_at, \
     revocation_reason, ip_address, user_agent, device_fingerprint, created_at, last_used_at";

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
    policy: StoreCallPolicy,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool, policy: StoreCallPolicy) -> Self {
        Self { pool, policy }
    }
}

/// The stored row is the one `new` describes, written by an earlier attempt
/// whose response was lost
fn written_by(
    existing: Option<RefreshTokenRecord>,
    new: &NewRefreshToken,
) -> Option<RefreshTokenRecord> {
    existing.filter(|record| record.token_hash == new.token_hash && record.user_id == new.user_id)
}

async fn insert_record(
    conn: &mut PgConnection,
    new: &NewRefreshToken,
    now: DateTime<Utc>,
) -> Result<RefreshTokenRecord> {
    let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
        r#"
        INSERT INTO refresh_tokens (
            id, jti, user_id, token_hash, expires_at, is_revoked,
            ip_address, user_agent, device_fingerprint, created_at
        )
        VALUES ($1, $2, $3, $4, $5, false, $6, $7, $8, $9)
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(&new.jti)
    .bind(new.user_id)
    .bind(&new.token_hash)
    .bind(new.expires_at)
    .bind(&new.ip_address)
    .bind(&new.user_agent)
    .bind(&new.device_fingerprint)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(record)
}

async fn fetch_by_jti(conn: &mut PgConnection, jti: &str) -> Result<Option<RefreshTokenRecord>> {
    let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE jti = $1"
    ))
    .bind(jti)
    .fetch_optional(conn)
    .await?;

    Ok(record)
}

async fn rotate_in_transaction(
    pool: &PgPool,
    old_jti: &str,
    new: &NewRefreshToken,
    reason: RevocationReason,
    now: DateTime<Utc>,
) -> Result<RefreshTokenRecord> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE refresh_tokens
        SET is_revoked = true, revoked_at = $2, revocation_reason = $3, last_used_at = $2
        WHERE jti = $1 AND is_revoked = false
        "#,
    )
    .bind(old_jti)
    .bind(now)
    .bind(reason.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        // Either another rotation won, or an earlier attempt of this very
        // rotation committed before its response was lost.
        let successor = fetch_by_jti(&mut *tx, &new.jti).await?;
        tx.rollback().await?;

        return match written_by(successor, new) {
            Some(record) => {
                debug!(old_jti = %old_jti, new_jti = %record.jti, "Rotation already committed");
                Ok(record)
            }
            None => Err(AuthError::ReuseDetected),
        };
    }

    // Dropping `tx` on error rolls back, so the old row stays active
    let record = insert_record(&mut *tx, new, now).await?;
    tx.commit().await?;

    Ok(record)
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn issue(&self, new: NewRefreshToken, now: DateTime<Utc>) -> Result<RefreshTokenRecord> {
        let pool = &self.pool;
        let new = &new;
        let attempts = &AtomicU32::new(0);
        self.policy
            .call("issue", || async move {
                let retrying = attempts.fetch_add(1, Ordering::Relaxed) > 0;
                let mut conn = pool.acquire().await?;

                match insert_record(&mut conn, new, now).await {
                    Err(AuthError::DuplicateJti) if retrying => {
                        let existing = fetch_by_jti(&mut conn, &new.jti).await?;
                        match written_by(existing, new) {
                            Some(record) => {
                                debug!(jti = %record.jti, "Insert already committed");
                                Ok(record)
                            }
                            None => Err(AuthError::DuplicateJti),
                        }
                    }
                    other => other,
                }
            })
            .await
    }

    async fn find_active(
        &self,
        jti: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>> {
        let pool = &self.pool;
        self.policy
            .call("find_active", || async move {
                let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
                    r#"
                    SELECT {RECORD_COLUMNS} FROM refresh_tokens
                    WHERE jti = $1 AND is_revoked = false AND expires_at > $2
                    "#
                ))
                .bind(jti)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                Ok(record)
            })
            .await
    }

    async fn find_by_jti(&self, jti: &str) -> Result<Option<RefreshTokenRecord>> {
        let pool = &self.pool;
        self.policy
            .call("find_by_jti", || async move {
                let mut conn = pool.acquire().await?;
                fetch_by_jti(&mut conn, jti).await
            })
            .await
    }

    async fn rotate(
        &self,
        old_jti: &str,
        new: NewRefreshToken,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord> {
        let pool = &self.pool;
        let new = &new;
        let record = self
            .policy
            .call("rotate", || rotate_in_transaction(pool, old_jti, new, reason, now))
            .await?;

        info!(
            user_id = %record.user_id,
            old_jti = %old_jti,
            new_jti = %record.jti,
            "Refresh token rotated"
        );
        Ok(record)
    }

    async fn revoke(
        &self,
        jti: &str,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = &self.pool;
        let affected = self
            .policy
            .call("revoke", || async move {
                let result = sqlx::query(
                    r#"
                    UPDATE refresh_tokens
                    SET is_revoked = true, revoked_at = $2, revocation_reason = $3
                    WHERE jti = $1 AND is_revoked = false
                    "#,
                )
                .bind(jti)
                .bind(now)
                .bind(reason.as_str())
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

        Ok(affected > 0)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RevokedToken>> {
        let pool = &self.pool;
        let revoked = self
            .policy
            .call("revoke_all_for_user", || async move {
                let rows = sqlx::query_as::<_, RevokedToken>(
                    r#"
                    UPDATE refresh_tokens
                    SET is_revoked = true, revoked_at = $2, revocation_reason = $3
                    WHERE user_id = $1 AND is_revoked = false
                    RETURNING jti, expires_at
                    "#,
                )
                .bind(user_id)
                .bind(now)
                .bind(reason.as_str())
                .fetch_all(pool)
                .await?;
                Ok(rows)
            })
            .await?;

        warn!(
            user_id = %user_id,
            count = revoked.len(),
            reason = %reason,
            "All refresh tokens revoked for user"
        );
        Ok(revoked)
    }

    async fn touch(&self, jti: &str, now: DateTime<Utc>) -> Result<()> {
        // Single attempt: this write must never hold up authentication
        let timeout = self.policy.timeout;
        let update = sqlx::query("UPDATE refresh_tokens SET last_used_at = $2 WHERE jti = $1")
            .bind(jti)
            .bind(now)
            .execute(&self.pool);

        match tokio::time::timeout(timeout, update).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(AuthError::StorageUnavailable(format!(
                "touch timed out after {:?}",
                timeout
            ))),
        }
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let pool = &self.pool;
        self.policy
            .call("list_active_for_user", || async move {
                let records = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
                    r#"
                    SELECT {RECORD_COLUMNS} FROM refresh_tokens
                    WHERE user_id = $1 AND is_revoked = false AND expires_at > $2
                    ORDER BY created_at DESC
                    "#
                ))
                .bind(user_id)
                .bind(now)
                .fetch_all(pool)
                .await?;
                Ok(records)
            })
            .await
    }

    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let pool = &self.pool;
        let deleted = self
            .policy
            .call("purge_expired", || async move {
                let result = sqlx::query(
                    r#"
                    DELETE FROM refresh_tokens
                    WHERE expires_at < $1
                       OR (is_revoked = true AND revoked_at < $1)
                    "#,
                )
                .bind(older_than)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

        if deleted > 0 {
            info!(deleted, "Purged refresh tokens past retention");
        }
        Ok(deleted)
    }
}
