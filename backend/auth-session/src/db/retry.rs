/// Timeout and bounded retry for refresh token store calls
///
/// Every attempt runs under a timeout so an unreachable database surfaces as
/// `StorageUnavailable` instead of freezing logins. Only `StorageUnavailable`
/// is retried, with exponential backoff and ±30% jitter; every other error,
/// and the last `StorageUnavailable`, is returned unchanged.
use crate::config::StoreSettings;
use crate::error::{AuthError, Result};
use crate::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StoreCallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for StoreCallPolicy {
    fn default() -> Self {
        Self::from(&StoreSettings::default())
    }
}

impl From<&StoreSettings> for StoreCallPolicy {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl StoreCallPolicy {
    /// Run `f` under the policy. `f` is invoked once per attempt.
    pub async fn call<F, Fut, T>(&self, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::StorageUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                ))),
            };

            match outcome {
                Err(AuthError::StorageUnavailable(reason)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.jittered(backoff);
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Refresh token store unavailable, retrying"
                    );
                    metrics::record_store_retry();

                    tokio::time::sleep(delay).await;

                    backoff = Duration::from_millis(
                        ((backoff.as_millis() as f64 * self.backoff_multiplier)
                            .min(self.max_backoff.as_millis() as f64)) as u64,
                    );
                }
                other => return other,
            }
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            Duration::from_millis((base.as_millis() as f64 * factor) as u64)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> StoreCallPolicy {
        StoreCallPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = policy(3)
            .call("issue", move || {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err(AuthError::StorageUnavailable("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = policy(2)
            .call("issue", move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(AuthError::StorageUnavailable("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(AuthError::StorageUnavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_storage_errors_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = policy(3)
            .call("rotate", move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(AuthError::ReuseDetected) }
            })
            .await;

        assert!(matches!(result, Err(AuthError::ReuseDetected)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_call_times_out_as_storage_unavailable() {
        let result: Result<()> = policy(0)
            .call("find_active", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AuthError::StorageUnavailable(_))));
    }
}
