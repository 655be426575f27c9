/// Per-principal brute-force protection
///
/// Each key walks a small state machine:
///
/// ```text
/// CLOSED (no record) --fail--> COUNTING (1..max-1) --fail--> LOCKED (until now+duration)
///        ^                                                          |
///        +------------- success, or lock elapsed (lazy) ------------+
/// ```
///
/// There is no background sweeper for the LOCKED -> CLOSED edge: the first
/// read after `locked_until` performs it. Memory is bounded separately:
/// every 1024th failure drops records that are unlocked and have been idle
/// for a full lockout duration, and [`LockoutGuard::purge_idle`] does the
/// same on demand with any idle window.
///
/// Credential stuffing is inherently concurrent, so every transition runs
/// under the per-key shard lock of a `DashMap` entry; increments are never
/// lost.
use crate::clock::Clock;
use crate::config::LockoutSettings;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failures recorded between sweeps of idle records
const SWEEP_EVERY: u64 = 1024;

/// Build the lockout key for a login attempt
pub fn lockout_key(username: &str, ip: Option<&str>, include_ip: bool) -> String {
    let username = username.trim().to_lowercase();
    match (include_ip, ip) {
        (true, Some(ip)) => format!("{}|{}", username, ip.trim()),
        _ => username,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub failed_count: u32,
    pub remaining_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// This failure is the one that tripped the lock
    pub just_locked: bool,
}

#[async_trait]
pub trait LockoutGuard: Send + Sync {
    async fn record_failed_attempt(&self, key: &str) -> LockoutStatus;

    /// `Some(unlock_time)` while locked
    async fn is_locked(&self, key: &str) -> Option<DateTime<Utc>>;

    async fn reset_attempts(&self, key: &str);

    async fn get_remaining_attempts(&self, key: &str) -> u32;

    /// Forget records that are unlocked and have seen no failure for `idle_for`
    async fn purge_idle(&self, idle_for: Duration) -> usize;
}

#[derive(Debug, Clone)]
struct LockoutRecord {
    failed_count: u32,
    locked_until: Option<DateTime<Utc>>,
    last_failure_at: DateTime<Utc>,
}

impl LockoutRecord {
    fn lock_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if now >= until)
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if now < until)
    }
}

pub struct InMemoryLockoutGuard {
    records: DashMap<String, LockoutRecord>,
    failures: AtomicU64,
    max_attempts: u32,
    lockout_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockoutGuard {
    pub fn new(settings: &LockoutSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            failures: AtomicU64::new(0),
            max_attempts: settings.max_attempts.max(1),
            lockout_duration: settings.lockout_duration(),
            clock,
        }
    }

    /// Lazy LOCKED -> CLOSED transition
    fn clear_if_elapsed(&self, key: &str, now: DateTime<Utc>) {
        if self
            .records
            .remove_if(key, |_, record| record.lock_elapsed(now))
            .is_some()
        {
            info!(key = %key, "Lockout expired, attempts reset");
        }
    }

    fn sweep_idle(&self, idle_for: Duration, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            record.is_locked(now) || now - record.last_failure_at < idle_for
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "Dropped idle lockout records");
        }
        removed
    }
}

#[async_trait]
impl LockoutGuard for InMemoryLockoutGuard {
    async fn record_failed_attempt(&self, key: &str) -> LockoutStatus {
        let now = self.clock.now();
        let status = {
            let mut record = self
                .records
                .entry(key.to_string())
                .or_insert_with(|| LockoutRecord {
                    failed_count: 0,
                    locked_until: None,
                    last_failure_at: now,
                });

            if record.lock_elapsed(now) {
                record.failed_count = 0;
                record.locked_until = None;
            }

            record.failed_count = record.failed_count.saturating_add(1);
            record.last_failure_at = now;

            let mut just_locked = false;
            if record.failed_count >= self.max_attempts && record.locked_until.is_none() {
                let until = now + self.lockout_duration;
                record.locked_until = Some(until);
                just_locked = true;
                warn!(
                    key = %key,
                    failed_count = record.failed_count,
                    locked_until = %until,
                    "Account locked after repeated failed attempts"
                );
            }

            LockoutStatus {
                failed_count: record.failed_count,
                remaining_attempts: self.max_attempts.saturating_sub(record.failed_count),
                locked_until: record.locked_until,
                just_locked,
            }
        };

        // The entry guard above must be released before retain takes every shard
        if (self.failures.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep_idle(self.lockout_duration, now);
        }

        status
    }

    async fn is_locked(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.clear_if_elapsed(key, now);

        self.records
            .get(key)
            .and_then(|record| record.locked_until.filter(|until| now < *until))
    }

    async fn reset_attempts(&self, key: &str) {
        self.records.remove(key);
    }

    async fn get_remaining_attempts(&self, key: &str) -> u32 {
        let now = self.clock.now();
        self.clear_if_elapsed(key, now);

        match self.records.get(key) {
            Some(record) if record.is_locked(now) => 0,
            Some(record) => self.max_attempts.saturating_sub(record.failed_count),
            None => self.max_attempts,
        }
    }

    async fn purge_idle(&self, idle_for: Duration) -> usize {
        self.sweep_idle(idle_for, self.clock.now())
    }
}
