/// Auth Session Library
///
/// Token lifecycle and brute-force protection for Nova authentication:
/// short-lived access tokens, rotating refresh tokens with reuse detection,
/// an in-process revocation fast path and a per-principal lockout guard.
///
/// ## Modules
///
/// - `clock`: Injectable time source
/// - `config`: Settings loaded from the environment
/// - `db`: Refresh token stores (PostgreSQL, in-memory) and principal lookup
/// - `error`: Error types
/// - `metrics`: Prometheus counters
/// - `models`: Refresh token records and request/response shapes
/// - `security`: Token codec, revocation list, lockout guard, password seam
/// - `services`: Session orchestration and the background reaper
/// - `telemetry`: Tracing subscriber setup
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod security;
pub mod services;
pub mod telemetry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use db::{InMemoryRefreshTokenStore, PgRefreshTokenStore, RefreshTokenStore};
pub use error::{AuthError, Result};
pub use models::{ClientContext, LoginRequest, LoginResponse, RevocationReason, TokenPair};
pub use security::{LockoutGuard, RevocationList, TokenCodec, TokenType};
pub use services::{AuthSessionService, Reaper};
