/// Login, refresh and logout orchestration
///
/// ## Session lineage
///
/// Login starts a lineage with one refresh record. Every refresh rotates it:
/// the presented record is revoked with reason `rotated` and its successor is
/// inserted in the same transaction, so a lineage has exactly one active
/// record at a time.
///
/// ## Reuse response
///
/// A refresh token whose record is revoked, or whose jti is in the
/// revocation list, is a token that has already been spent. Presenting it
/// again means two parties hold it, so every session of the user is revoked
/// and both have to log in again.
///
/// ## Access tokens
///
/// Access tokens are never persisted. Each carries `sid`, the jti of the
/// refresh token issued alongside it; pushing that jti into the revocation
/// list cuts the access token off before its natural expiry.
use crate::clock::Clock;
use crate::config::Settings;
use crate::db::{PrincipalDirectory, RefreshTokenStore};
use crate::error::{AuthError, Result};
use crate::metrics;
use crate::models::{
    hash_token, ClientContext, LoginRequest, LoginResponse, NewRefreshToken, RefreshTokenRecord,
    RevocationReason, RevokedToken, TokenPair,
};
use crate::security::{
    hash_password, lockout_key, Claims, InMemoryLockoutGuard, InMemoryRevocationList,
    IssuedToken, LockoutGuard, PasswordVerifier, RevocationList, TokenCodec, TokenType,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at minting a refresh token before a jti collision is surfaced
const MAX_ISSUE_ATTEMPTS: u32 = 3;

const TOKEN_TYPE_BEARER: &str = "Bearer";

/// Hash checked for unknown usernames so they cost the same as wrong passwords
static UNKNOWN_PRINCIPAL_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("unknown-principal-placeholder").ok());

#[derive(Clone)]
pub struct AuthSessionService {
    codec: Arc<TokenCodec>,
    store: Arc<dyn RefreshTokenStore>,
    revocation: Arc<dyn RevocationList>,
    lockout: Arc<dyn LockoutGuard>,
    principals: Arc<dyn PrincipalDirectory>,
    verifier: Arc<dyn PasswordVerifier>,
    clock: Arc<dyn Clock>,
    lockout_key_includes_ip: bool,
}

impl AuthSessionService {
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<dyn RefreshTokenStore>,
        revocation: Arc<dyn RevocationList>,
        lockout: Arc<dyn LockoutGuard>,
        principals: Arc<dyn PrincipalDirectory>,
        verifier: Arc<dyn PasswordVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            store,
            revocation,
            lockout,
            principals,
            verifier,
            clock,
            lockout_key_includes_ip: false,
        }
    }

    /// Wire the service with in-process revocation list and lockout guard
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn RefreshTokenStore>,
        principals: Arc<dyn PrincipalDirectory>,
        verifier: Arc<dyn PasswordVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let codec = Arc::new(TokenCodec::new(&settings.tokens));
        let revocation = Arc::new(InMemoryRevocationList::new(clock.clone()));
        let lockout = Arc::new(InMemoryLockoutGuard::new(&settings.lockout, clock.clone()));

        Self::new(codec, store, revocation, lockout, principals, verifier, clock)
            .with_lockout_key_includes_ip(settings.lockout.key_includes_ip)
    }

    /// Count failures per username and source IP instead of per username
    pub fn with_lockout_key_includes_ip(mut self, include_ip: bool) -> Self {
        self.lockout_key_includes_ip = include_ip;
        self
    }

    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    pub fn revocation_list(&self) -> &Arc<dyn RevocationList> {
        &self.revocation
    }

    pub fn lockout_guard(&self) -> &Arc<dyn LockoutGuard> {
        &self.lockout
    }

    pub fn store(&self) -> &Arc<dyn RefreshTokenStore> {
        &self.store
    }

    /// Authenticate with username and password
    ///
    /// ## Workflow
    ///
    /// 1. Refuse a locked key before any credential check
    /// 2. Look up the principal and verify the password off the async runtime
    /// 3. On failure count the attempt; on success clear the count
    /// 4. Issue a refresh record and an access token bound to it
    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let now = self.clock.now();
        let key = lockout_key(
            &request.username,
            request.client.ip_address.as_deref(),
            self.lockout_key_includes_ip,
        );

        if let Some(unlock_at) = self.lockout.is_locked(&key).await {
            metrics::record_login("locked");
            warn!(key = %key, unlock_at = %unlock_at, "Login refused, account locked");
            return Err(AuthError::AccountLocked(unlock_at));
        }

        let principal = self
            .principals
            .find_by_username(request.username.trim())
            .await?;

        let known_principal = principal.is_some();
        let verified = match &principal {
            Some(principal) => {
                self.check_password(&request.password, &principal.password_hash)
                    .await?
            }
            None => {
                let outcome = match UNKNOWN_PRINCIPAL_HASH.as_deref() {
                    Some(hash) => self.check_password(&request.password, hash).await,
                    None => Err(AuthError::Internal("placeholder hash unavailable".into())),
                };
                if let Err(e) = outcome {
                    // Unknown usernames now answer faster than wrong passwords
                    warn!(
                        error = %e,
                        "Placeholder password check failed for unknown username"
                    );
                }
                false
            }
        };

        let principal = match principal {
            Some(principal) if verified => principal,
            _ => {
                let status = self.lockout.record_failed_attempt(&key).await;
                metrics::record_login("invalid_credentials");
                if status.just_locked {
                    metrics::record_lockout();
                }
                debug!(
                    key = %key,
                    known_principal,
                    remaining_attempts = status.remaining_attempts,
                    "Login failed"
                );
                return Err(AuthError::InvalidCredentials);
            }
        };

        self.lockout.reset_attempts(&key).await;

        let (refresh, record) = self
            .issue_refresh(&principal.username, principal.id, &request.client, now)
            .await?;
        let access_token =
            self.codec
                .create_session_access_token(&principal.username, &refresh.jti, now)?;

        metrics::record_login("success");
        info!(
            user_id = %principal.id,
            jti = %record.jti,
            ip_address = ?record.ip_address,
            "Login succeeded"
        );

        Ok(self.token_pair(access_token, refresh).into())
    }

    /// Exchange a refresh token for a new access and refresh pair
    pub async fn refresh(&self, refresh_token: &str, client: ClientContext) -> Result<TokenPair> {
        let now = self.clock.now();
        let claims = self.codec.verify(refresh_token, TokenType::Refresh, now)?;
        let old_jti = claims.require_jti()?.to_string();

        let active = if self.revocation.is_revoked(&old_jti).await {
            None
        } else {
            self.store.find_active(&old_jti, now).await?
        };

        let current = match active {
            Some(record) => record,
            None => return Err(self.respond_to_reuse(&old_jti, now).await),
        };

        if current.token_hash != hash_token(refresh_token) {
            warn!(jti = %old_jti, "Refresh token does not match its stored hash");
            return Err(AuthError::InvalidSignature);
        }

        if let Err(e) = self.store.touch(&old_jti, now).await {
            warn!(jti = %old_jti, error = %e, "Failed to update refresh token last_used_at");
        }

        let (refresh, record) = match self
            .rotate_refresh(&claims, &current, &client, now)
            .await
        {
            Ok(rotated) => rotated,
            Err(AuthError::ReuseDetected) => {
                return Err(self.respond_to_reuse(&old_jti, now).await)
            }
            Err(e) => return Err(e),
        };

        self.revocation
            .revoke(&old_jti, self.revocation_horizon(current.expires_at, now))
            .await;

        let access_token = self
            .codec
            .create_session_access_token(&claims.sub, &record.jti, now)?;

        metrics::record_rotation();
        metrics::record_revocations(RevocationReason::Rotated.as_str(), 1);

        Ok(self.token_pair(access_token, refresh))
    }

    /// End the session the refresh token belongs to.
    ///
    /// An expired refresh token still identifies its session, so expiry is not
    /// checked here. Logging out an already-revoked session succeeds.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let now = self.clock.now();
        let claims = self
            .codec
            .verify_ignoring_expiry(refresh_token, TokenType::Refresh)?;
        let jti = claims.require_jti()?;

        let revoked = self.store.revoke(jti, RevocationReason::Logout, now).await?;
        self.revocation
            .revoke(jti, self.revocation_horizon(claims.expires_at(), now))
            .await;

        if revoked {
            metrics::record_revocations(RevocationReason::Logout.as_str(), 1);
            info!(jti = %jti, "Session logged out");
        } else {
            debug!(jti = %jti, "Logout of a session that was already revoked");
        }

        Ok(())
    }

    /// Revoke every session of a user. Returns how many were still active.
    pub async fn logout_all(&self, user_id: Uuid, reason: RevocationReason) -> Result<usize> {
        let now = self.clock.now();
        let revoked = self.store.revoke_all_for_user(user_id, reason, now).await?;
        self.push_revoked(&revoked, now).await;

        metrics::record_revocations(reason.as_str(), revoked.len() as u64);
        info!(
            user_id = %user_id,
            reason = %reason,
            count = revoked.len(),
            "Revoked all sessions for user"
        );

        Ok(revoked.len())
    }

    /// Verify an access token presented on an API call
    pub async fn verify_access_token(&self, token: &str) -> Result<Claims> {
        let claims = self
            .codec
            .verify(token, TokenType::Access, self.clock.now())?;

        for jti in [claims.jti.as_deref(), claims.sid.as_deref()]
            .into_iter()
            .flatten()
        {
            if self.revocation.is_revoked(jti).await {
                debug!(jti = %jti, sub = %claims.sub, "Access token revoked");
                return Err(AuthError::TokenRevoked);
            }
        }

        Ok(claims)
    }

    /// Active sessions of a user, newest first
    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<RefreshTokenRecord>> {
        self.store
            .list_active_for_user(user_id, self.clock.now())
            .await
    }

    async fn check_password(&self, raw: &str, hash: &str) -> Result<bool> {
        let verifier = self.verifier.clone();
        let raw = raw.to_string();
        let hash = hash.to_string();

        tokio::task::spawn_blocking(move || verifier.verify_password(&raw, &hash)).await?
    }

    async fn issue_refresh(
        &self,
        subject: &str,
        user_id: Uuid,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<(IssuedToken, RefreshTokenRecord)> {
        let mut attempt = 1;
        loop {
            let issued = self.codec.create_refresh_token(subject, now)?;
            let new = new_record(user_id, &issued, client);

            match self.store.issue(new, now).await {
                Ok(record) => return Ok((issued, record)),
                Err(AuthError::DuplicateJti) if attempt < MAX_ISSUE_ATTEMPTS => {
                    warn!(user_id = %user_id, attempt, "Refresh token jti collision, reissuing");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn rotate_refresh(
        &self,
        claims: &Claims,
        current: &RefreshTokenRecord,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<(IssuedToken, RefreshTokenRecord)> {
        let mut attempt = 1;
        loop {
            let issued = self.codec.create_refresh_token(&claims.sub, now)?;
            let new = new_record(current.user_id, &issued, client);

            match self
                .store
                .rotate(&current.jti, new, RevocationReason::Rotated, now)
                .await
            {
                Ok(record) => return Ok((issued, record)),
                Err(AuthError::DuplicateJti) if attempt < MAX_ISSUE_ATTEMPTS => {
                    warn!(jti = %current.jti, attempt, "Refresh token jti collision, reissuing");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Revoke the whole family of a spent refresh token. Returns the error the
    /// caller should see.
    async fn respond_to_reuse(&self, jti: &str, now: DateTime<Utc>) -> AuthError {
        metrics::record_reuse_detected();

        let record = match self.store.find_by_jti(jti).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(jti = %jti, "Refresh token with unknown jti presented");
                return AuthError::ReuseDetected;
            }
            Err(e) => return e,
        };

        error!(
            user_id = %record.user_id,
            jti = %jti,
            revocation_reason = ?record.revocation_reason,
            "Refresh token reuse detected, possible token theft; revoking all sessions"
        );

        match self
            .store
            .revoke_all_for_user(record.user_id, RevocationReason::ReuseDetected, now)
            .await
        {
            Ok(revoked) => {
                self.push_revoked(&revoked, now).await;
                metrics::record_revocations(
                    RevocationReason::ReuseDetected.as_str(),
                    revoked.len() as u64,
                );
                AuthError::ReuseDetected
            }
            Err(e) => {
                error!(
                    user_id = %record.user_id,
                    error = %e,
                    "Failed to revoke sessions after reuse detection"
                );
                e
            }
        }
    }

    async fn push_revoked(&self, revoked: &[RevokedToken], now: DateTime<Utc>) {
        for token in revoked {
            self.revocation
                .revoke(&token.jti, self.revocation_horizon(token.expires_at, now))
                .await;
        }
    }

    /// A revoked refresh jti must outlive every access token naming it as `sid`
    fn revocation_horizon(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        expires_at.max(now + self.codec.access_ttl())
    }

    fn token_pair(&self, access_token: String, refresh: IssuedToken) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token: refresh.token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: self.codec.access_ttl().num_seconds(),
        }
    }
}

fn new_record(user_id: Uuid, issued: &IssuedToken, client: &ClientContext) -> NewRefreshToken {
    NewRefreshToken {
        user_id,
        jti: issued.jti.clone(),
        token_hash: hash_token(&issued.token),
        expires_at: issued.expires_at,
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
        device_fingerprint: client.device_fingerprint.clone(),
    }
}
