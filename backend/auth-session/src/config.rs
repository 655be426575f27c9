//! Configuration for the auth session subsystem
//!
//! Loads settings from environment variables (a `.env` file is honoured in
//! debug builds). Every knob has a production default except the signing
//! secret and, for the maintenance binary, the database URL.
//!
//! # Example
//!
//! ```no_run
//! use auth_session::config::Settings;
//!
//! let settings = Settings::load().expect("settings");
//! println!("access ttl: {}s", settings.tokens.access_ttl_secs);
//! ```

use crate::security::secret_validation::{validate_secret_strength, SecretStrength};
use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_ACCESS_TTL_SECS: i64 = 900;
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT_DURATION_SECS: i64 = 900;

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub tokens: TokenSettings,
    pub lockout: LockoutSettings,
    pub store: StoreSettings,
    pub reaper: ReaperSettings,
    pub database: Option<DatabaseSettings>,
}

impl Settings {
    /// Load settings from the process environment
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) && dotenvy::dotenv().is_ok() {
            info!("Loaded .env file for development");
        }
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            tokens: TokenSettings::from_source(&lookup)?,
            lockout: LockoutSettings::from_source(&lookup)?,
            store: StoreSettings::from_source(&lookup)?,
            reaper: ReaperSettings::from_source(&lookup)?,
            database: DatabaseSettings::from_source(&lookup)?,
        })
    }
}

/// Token signing settings
#[derive(Clone)]
pub struct TokenSettings {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

impl TokenSettings {
    /// Build settings with default TTLs, mainly for tests and embedding
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
        }
    }

    fn from_source<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_secret = lookup("AUTH_ACCESS_TOKEN_SECRET")
            .context("AUTH_ACCESS_TOKEN_SECRET must be set")?;
        let refresh_secret =
            lookup("AUTH_REFRESH_TOKEN_SECRET").unwrap_or_else(|| access_secret.clone());

        check_secret("AUTH_ACCESS_TOKEN_SECRET", &access_secret)?;
        check_secret("AUTH_REFRESH_TOKEN_SECRET", &refresh_secret)?;

        let settings = Self {
            access_secret,
            refresh_secret,
            access_ttl_secs: parse_or(lookup, "AUTH_ACCESS_TOKEN_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?,
            refresh_ttl_secs: parse_or(
                lookup,
                "AUTH_REFRESH_TOKEN_TTL_SECS",
                DEFAULT_REFRESH_TTL_SECS,
            )?,
        };

        if settings.access_ttl_secs <= 0 || settings.refresh_ttl_secs <= 0 {
            bail!("token TTLs must be positive");
        }
        if settings.access_ttl_secs >= settings.refresh_ttl_secs {
            warn!(
                access_ttl_secs = settings.access_ttl_secs,
                refresh_ttl_secs = settings.refresh_ttl_secs,
                "Access token TTL is not shorter than refresh token TTL"
            );
        }

        Ok(settings)
    }

    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_ttl_secs)
    }
}

impl fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSettings")
            .field("access_secret", &"[REDACTED]")
            .field("refresh_secret", &"[REDACTED]")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

/// Brute-force protection settings
#[derive(Debug, Clone)]
pub struct LockoutSettings {
    pub max_attempts: u32,
    pub lockout_duration_secs: i64,
    /// Key lockout records by username and source IP instead of username alone
    pub key_includes_ip: bool,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout_duration_secs: DEFAULT_LOCKOUT_DURATION_SECS,
            key_includes_ip: false,
        }
    }
}

impl LockoutSettings {
    fn from_source<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Self {
            max_attempts: parse_or(lookup, "AUTH_MAX_LOGIN_ATTEMPTS", DEFAULT_MAX_LOGIN_ATTEMPTS)?,
            lockout_duration_secs: parse_or(
                lookup,
                "AUTH_LOCKOUT_DURATION_SECS",
                DEFAULT_LOCKOUT_DURATION_SECS,
            )?,
            key_includes_ip: parse_or(lookup, "AUTH_LOCKOUT_KEY_INCLUDES_IP", false)?,
        };

        if settings.max_attempts == 0 {
            bail!("AUTH_MAX_LOGIN_ATTEMPTS must be at least 1");
        }
        if settings.lockout_duration_secs <= 0 {
            bail!("AUTH_LOCKOUT_DURATION_SECS must be positive");
        }

        Ok(settings)
    }

    pub fn lockout_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lockout_duration_secs)
    }
}

/// Refresh token store call policy
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            max_retries: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

impl StoreSettings {
    fn from_source<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            timeout_ms: parse_or(lookup, "AUTH_STORE_TIMEOUT_MS", defaults.timeout_ms)?,
            max_retries: parse_or(lookup, "AUTH_STORE_MAX_RETRIES", defaults.max_retries)?,
            initial_backoff_ms: parse_or(
                lookup,
                "AUTH_STORE_INITIAL_BACKOFF_MS",
                defaults.initial_backoff_ms,
            )?,
            max_backoff_ms: parse_or(lookup, "AUTH_STORE_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background cleanup settings
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub refresh_token_retention_days: i64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            refresh_token_retention_days: 90,
        }
    }
}

impl ReaperSettings {
    fn from_source<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            interval_secs: parse_or(lookup, "AUTH_REAPER_INTERVAL_SECS", defaults.interval_secs)?,
            refresh_token_retention_days: parse_or(
                lookup,
                "AUTH_REFRESH_TOKEN_RETENTION_DAYS",
                defaults.refresh_token_retention_days,
            )?,
        };
        if settings.interval_secs == 0 {
            bail!("AUTH_REAPER_INTERVAL_SECS must be positive");
        }
        Ok(settings)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.refresh_token_retention_days)
    }
}

/// PostgreSQL connection settings
#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseSettings {
    fn from_source<F>(lookup: &F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(url) = lookup("DATABASE_URL") else {
            return Ok(None);
        };

        Ok(Some(Self {
            url,
            max_connections: parse_or(lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            acquire_timeout_secs: parse_or(lookup, "DATABASE_ACQUIRE_TIMEOUT", 5)?,
        }))
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn check_secret(name: &str, secret: &str) -> Result<()> {
    match validate_secret_strength(secret) {
        SecretStrength::Weak => {
            bail!("{name} is too weak: use at least 32 random bytes")
        }
        SecretStrength::Acceptable => {
            warn!("{} is acceptable but shorter than the recommended 64 bytes", name);
            Ok(())
        }
        SecretStrength::Strong => Ok(()),
    }
}
