/// Token revocation fast path
///
/// Protects access tokens (which have no persisted record) from use after
/// logout, and short-circuits refresh tokens already known to be revoked.
///
/// ## Architecture
///
/// - **This module**: in-process set of revoked jtis, sub-millisecond lookups
/// - **RefreshTokenStore**: persistent `is_revoked` flag (source of truth)
///
/// The in-memory list is single-process and best effort. Callers depend only
/// on the [`RevocationList`] trait, so a shared-cache implementation can be
/// swapped in for multi-instance deployments.
///
/// ## Memory
///
/// Every entry remembers the natural expiry of the token it revokes. Once
/// that instant has passed the token is rejected by signature verification
/// anyway, so a read drops the entry. Every 1024th insertion sweeps the
/// rest, which keeps memory bounded with or without a reaper calling
/// [`RevocationList::purge_expired`].
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Insertions between sweeps of expired entries
const SWEEP_EVERY: u64 = 1024;

#[async_trait]
pub trait RevocationList: Send + Sync {
    /// Mark `jti` revoked until `expires_at`. Idempotent; a later expiry wins.
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>);

    async fn is_revoked(&self, jti: &str) -> bool;

    /// Drop entries whose token has expired, returning how many were removed
    async fn purge_expired(&self) -> usize;

    async fn len(&self) -> usize;
}

pub struct InMemoryRevocationList {
    entries: DashMap<String, DateTime<Utc>>,
    inserts: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryRevocationList {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            inserts: AtomicU64::new(0),
            clock,
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired revocation entries");
        }
        removed
    }
}

#[async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) {
        self.entries
            .entry(jti.to_string())
            .and_modify(|existing| {
                if expires_at > *existing {
                    *existing = expires_at;
                }
            })
            .or_insert(expires_at);

        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep(self.clock.now());
        }
    }

    async fn is_revoked(&self, jti: &str) -> bool {
        let now = self.clock.now();
        if self
            .entries
            .remove_if(jti, |_, expires_at| *expires_at <= now)
            .is_some()
        {
            return false;
        }

        match self.entries.get(jti) {
            Some(expires_at) => *expires_at > now,
            None => false,
        }
    }

    async fn purge_expired(&self) -> usize {
        self.sweep(self.clock.now())
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}
