/// Logging setup for processes embedding the auth session subsystem
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "auth_session=info,info";

/// JSON logs filtered by `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .try_init();
}
