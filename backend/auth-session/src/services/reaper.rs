/// Periodic cleanup of in-process state and old refresh token rows
///
/// Nothing in the authentication flow depends on this job: revocation
/// entries past expiry are already ignored on read and elapsed locks are
/// lifted lazily. The reaper only bounds memory and table growth.
use crate::clock::Clock;
use crate::config::ReaperSettings;
use crate::db::RefreshTokenStore;
use crate::error::Result;
use crate::security::{LockoutGuard, RevocationList};
use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub revocation_entries: usize,
    pub lockout_records: usize,
    pub refresh_tokens: u64,
}

pub struct Reaper {
    settings: ReaperSettings,
    lockout_idle: Duration,
    revocation: Option<Arc<dyn RevocationList>>,
    lockout: Option<Arc<dyn LockoutGuard>>,
    store: Option<Arc<dyn RefreshTokenStore>>,
    clock: Arc<dyn Clock>,
}

impl Reaper {
    /// `lockout_idle`: how long an unlocked lockout record is kept after its
    /// last failure
    pub fn new(settings: ReaperSettings, lockout_idle: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            lockout_idle,
            revocation: None,
            lockout: None,
            store: None,
            clock,
        }
    }

    pub fn with_revocation_list(mut self, revocation: Arc<dyn RevocationList>) -> Self {
        self.revocation = Some(revocation);
        self
    }

    pub fn with_lockout_guard(mut self, lockout: Arc<dyn LockoutGuard>) -> Self {
        self.lockout = Some(lockout);
        self
    }

    /// Also delete refresh token rows older than the retention window
    pub fn with_store(mut self, store: Arc<dyn RefreshTokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// One cleanup pass
    pub async fn run_once(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        if let Some(revocation) = &self.revocation {
            report.revocation_entries = revocation.purge_expired().await;
        }

        if let Some(lockout) = &self.lockout {
            report.lockout_records = lockout.purge_idle(self.lockout_idle).await;
        }

        if let Some(store) = &self.store {
            let cutoff = self.clock.now() - self.settings.retention();
            report.refresh_tokens = store.purge_expired(cutoff).await?;
        }

        debug!(?report, "Reaper pass complete");
        Ok(report)
    }

    /// Run passes on the configured interval until the task is aborted
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.settings.interval_secs,
                retention_days = self.settings.refresh_token_retention_days,
                "Starting auth session reaper"
            );

            loop {
                ticker.tick().await;

                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Auth session reaper pass failed");
                }
            }
        })
    }
}
