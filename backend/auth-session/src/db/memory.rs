/// In-process refresh token store
///
/// Same contract as the PostgreSQL store, with a single mutex standing in for
/// the row lock. Used by embedders without a database and by the test suites.
use super::RefreshTokenStore;
use crate::error::{AuthError, Result};
use crate::models::{NewRefreshToken, RefreshTokenRecord, RevocationReason, RevokedToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    records: Mutex<HashMap<String, RefreshTokenRecord>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

fn mark_revoked(record: &mut RefreshTokenRecord, reason: RevocationReason, now: DateTime<Utc>) {
    record.is_revoked = true;
    record.revoked_at = Some(now);
    record.revocation_reason = Some(reason.as_str().to_string());
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn issue(&self, new: NewRefreshToken, now: DateTime<Utc>) -> Result<RefreshTokenRecord> {
        let mut records = self.records.lock();
        if records.contains_key(&new.jti) {
            return Err(AuthError::DuplicateJti);
        }

        let record = new.into_record(now);
        records.insert(record.jti.clone(), record.clone());
        Ok(record)
    }

    async fn find_active(
        &self,
        jti: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>> {
        Ok(self
            .records
            .lock()
            .get(jti)
            .filter(|record| record.is_active(now))
            .cloned())
    }

    async fn find_by_jti(&self, jti: &str) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.records.lock().get(jti).cloned())
    }

    async fn rotate(
        &self,
        old_jti: &str,
        new: NewRefreshToken,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord> {
        let mut records = self.records.lock();

        let claimable = records
            .get(old_jti)
            .map(|record| !record.is_revoked)
            .unwrap_or(false);

        if !claimable {
            return match records.get(&new.jti) {
                Some(successor) if successor.token_hash == new.token_hash => {
                    Ok(successor.clone())
                }
                _ => Err(AuthError::ReuseDetected),
            };
        }

        // Checked before touching the old record so a collision leaves it active
        if records.contains_key(&new.jti) {
            return Err(AuthError::DuplicateJti);
        }

        if let Some(old) = records.get_mut(old_jti) {
            mark_revoked(old, reason, now);
            old.last_used_at = Some(now);
        }

        let record = new.into_record(now);
        records.insert(record.jti.clone(), record.clone());
        Ok(record)
    }

    async fn revoke(
        &self,
        jti: &str,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(jti) {
            Some(record) if !record.is_revoked => {
                mark_revoked(record, reason, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RevokedToken>> {
        let mut records = self.records.lock();
        let mut revoked = Vec::new();

        for record in records
            .values_mut()
            .filter(|record| record.user_id == user_id && !record.is_revoked)
        {
            mark_revoked(record, reason, now);
            revoked.push(RevokedToken {
                jti: record.jti.clone(),
                expires_at: record.expires_at,
            });
        }

        Ok(revoked)
    }

    async fn touch(&self, jti: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.records.lock().get_mut(jti) {
            record.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenRecord>> {
        let mut active: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|record| record.user_id == user_id && record.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| {
            let expired = record.expires_at < older_than;
            let revoked_long_ago = record
                .revoked_at
                .map(|revoked_at| revoked_at < older_than)
                .unwrap_or(false);
            !(expired || revoked_long_ago)
        });
        Ok((before - records.len()) as u64)
    }
}
