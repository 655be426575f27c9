/// Prometheus metrics for the auth session subsystem
///
/// Counters live on the default registry, so whichever process embeds the
/// service exposes them with its usual `/metrics` handler.
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts};

/// Initialize all counters up front (call from main() for early registration errors)
pub fn initialize_auth_session_metrics() {
    let _ = &*LOGIN_ATTEMPTS_TOTAL;
    let _ = &*ACCOUNT_LOCKOUTS_TOTAL;
    let _ = &*REFRESH_ROTATIONS_TOTAL;
    let _ = &*REFRESH_REUSE_DETECTED_TOTAL;
    let _ = &*TOKENS_REVOKED_TOTAL;
    let _ = &*STORE_RETRIES_TOTAL;
}

static LOGIN_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "auth_login_attempts_total",
        "Login attempts by outcome",
        &["outcome"],
    )
});

static ACCOUNT_LOCKOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "auth_account_lockouts_total",
        "Number of lockouts triggered by repeated failed logins",
    )
});

static REFRESH_ROTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "auth_refresh_rotations_total",
        "Number of successful refresh token rotations",
    )
});

static REFRESH_REUSE_DETECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "auth_refresh_reuse_detected_total",
        "Number of revoked refresh tokens presented again",
    )
});

static TOKENS_REVOKED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "auth_tokens_revoked_total",
        "Refresh tokens revoked, by reason",
        &["reason"],
    )
});

static STORE_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "auth_store_retries_total",
        "Refresh token store calls retried after StorageUnavailable",
    )
});

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help)
        .and_then(|c| {
            prometheus::default_registry().register(Box::new(c.clone()))?;
            Ok(c)
        })
        .unwrap_or_else(|e| {
            tracing::error!("failed to register {} counter: {}", name, e);
            IntCounter::new(format!("{name}_unregistered"), help).expect("fallback counter")
        })
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels)
        .and_then(|c| {
            prometheus::default_registry().register(Box::new(c.clone()))?;
            Ok(c)
        })
        .unwrap_or_else(|e| {
            tracing::error!("failed to register {} counter: {}", name, e);
            IntCounterVec::new(Opts::new(format!("{name}_unregistered"), help), labels)
                .expect("fallback counter")
        })
}

pub fn record_login(outcome: &str) {
    LOGIN_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_lockout() {
    ACCOUNT_LOCKOUTS_TOTAL.inc();
}

pub fn record_rotation() {
    REFRESH_ROTATIONS_TOTAL.inc();
}

pub fn record_reuse_detected() {
    REFRESH_REUSE_DETECTED_TOTAL.inc();
}

pub fn record_revocations(reason: &str, count: u64) {
    TOKENS_REVOKED_TOTAL.with_label_values(&[reason]).inc_by(count);
}

pub fn record_store_retry() {
    STORE_RETRIES_TOTAL.inc();
}
