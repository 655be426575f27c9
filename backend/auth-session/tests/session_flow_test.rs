//! End-to-end session flows against the in-memory store
//!
//! Real Argon2 hashes, a manual clock and isolated component instances per
//! test.

use async_trait::async_trait;
use auth_session::clock::{Clock, ManualClock};
use auth_session::config::{LockoutSettings, Settings, TokenSettings};
use auth_session::db::{InMemoryRefreshTokenStore, RefreshTokenStore, StaticPrincipalDirectory};
use auth_session::error::{AuthError, Result};
use auth_session::models::{
    ClientContext, LoginRequest, NewRefreshToken, RefreshTokenRecord, RevocationReason,
    RevokedToken,
};
use auth_session::security::{hash_password, Argon2PasswordVerifier, TokenType};
use auth_session::services::AuthSessionService;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

const SECRET: &str = "k3J9#pQ!vX2m@Lr7$Tz8&Wc4^Nh6*Yb1";

struct TestContext {
    service: AuthSessionService,
    clock: ManualClock,
    store: Arc<InMemoryRefreshTokenStore>,
}

fn setup() -> TestContext {
    let clock = ManualClock::default();
    let store = Arc::new(InMemoryRefreshTokenStore::new());
    let service = service_over(store.clone(), &clock);

    TestContext {
        service,
        clock,
        store,
    }
}

fn service_over(store: Arc<dyn RefreshTokenStore>, clock: &ManualClock) -> AuthSessionService {
    let principals = StaticPrincipalDirectory::new()
        .with_principal("alice", hash_password("correct-pw").unwrap())
        .with_principal("bob", hash_password("bob-pw").unwrap());

    let mut env = HashMap::new();
    env.insert("AUTH_ACCESS_TOKEN_SECRET", SECRET.to_string());
    let settings = Settings::from_source(|key| env.get(key).cloned()).unwrap();

    AuthSessionService::from_settings(
        &settings,
        store,
        Arc::new(principals),
        Arc::new(Argon2PasswordVerifier),
        Arc::new(clock.clone()),
    )
}

/// In-memory store whose named operations can be switched to fail with
/// `StorageUnavailable`
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryRefreshTokenStore,
    failing: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    fn heal(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.lock().contains(operation) {
            return Err(AuthError::StorageUnavailable(format!(
                "{operation} timed out"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for FlakyStore {
    async fn issue(&self, new: NewRefreshToken, now: DateTime<Utc>) -> Result<RefreshTokenRecord> {
        self.check("issue")?;
        self.inner.issue(new, now).await
    }

    async fn find_active(
        &self,
        jti: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>> {
        self.check("find_active")?;
        self.inner.find_active(jti, now).await
    }

    async fn find_by_jti(&self, jti: &str) -> Result<Option<RefreshTokenRecord>> {
        self.check("find_by_jti")?;
        self.inner.find_by_jti(jti).await
    }

    async fn rotate(
        &self,
        old_jti: &str,
        new: NewRefreshToken,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord> {
        self.check("rotate")?;
        self.inner.rotate(old_jti, new, reason, now).await
    }

    async fn revoke(
        &self,
        jti: &str,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check("revoke")?;
        self.inner.revoke(jti, reason, now).await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RevokedToken>> {
        self.check("revoke_all_for_user")?;
        self.inner.revoke_all_for_user(user_id, reason, now).await
    }

    async fn touch(&self, jti: &str, now: DateTime<Utc>) -> Result<()> {
        self.check("touch")?;
        self.inner.touch(jti, now).await
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenRecord>> {
        self.check("list_active_for_user")?;
        self.inner.list_active_for_user(user_id, now).await
    }

    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check("purge_expired")?;
        self.inner.purge_expired(older_than).await
    }
}

fn refresh_jti(ctx: &TestContext, token: &str) -> String {
    ctx.service
        .codec()
        .verify_ignoring_expiry(token, TokenType::Refresh)
        .unwrap()
        .jti
        .unwrap()
}

#[tokio::test]
async fn test_alice_login_succeeds() {
    let ctx = setup();

    let response = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .expect("login should succeed");

    let claims = ctx
        .service
        .verify_access_token(&response.access_token)
        .await
        .unwrap();
    assert_eq!(claims.sub, "alice");

    let record = ctx
        .store
        .find_by_jti(&refresh_jti(&ctx, &response.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_revoked);
    assert_eq!(response.expires_in, 900);
}

#[tokio::test]
async fn test_bob_locked_after_five_failures() {
    let ctx = setup();

    for _ in 0..5 {
        let result = ctx.service.login(LoginRequest::new("bob", "wrong")).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    // Correct password is refused while locked
    let result = ctx.service.login(LoginRequest::new("bob", "bob-pw")).await;
    let unlock_at = match result {
        Err(AuthError::AccountLocked(unlock_at)) => unlock_at,
        other => panic!("expected AccountLocked, got {:?}", other),
    };
    assert_eq!(unlock_at, ctx.clock.now() + Duration::seconds(900));

    ctx.clock.advance(Duration::seconds(901));
    ctx.service
        .login(LoginRequest::new("bob", "bob-pw"))
        .await
        .expect("lock should have lifted");
}

#[tokio::test]
async fn test_failures_are_counted_case_insensitively() {
    let ctx = setup();

    for name in ["Bob", "BOB", " bob ", "bOb", "bob"] {
        let _ = ctx.service.login(LoginRequest::new(name, "wrong")).await;
    }

    let result = ctx.service.login(LoginRequest::new("bob", "bob-pw")).await;
    assert!(matches!(result, Err(AuthError::AccountLocked(_))));
}

#[tokio::test]
async fn test_ip_scoped_lockout_isolates_sources() {
    let ctx = setup();
    let service = ctx.service.clone().with_lockout_key_includes_ip(true);
    let attacker = ClientContext {
        ip_address: Some("203.0.113.9".into()),
        ..Default::default()
    };
    let owner = ClientContext {
        ip_address: Some("198.51.100.7".into()),
        ..Default::default()
    };

    for _ in 0..5 {
        let _ = service
            .login(LoginRequest::new("bob", "wrong").with_client(attacker.clone()))
            .await;
    }

    let blocked = service
        .login(LoginRequest::new("bob", "bob-pw").with_client(attacker))
        .await;
    assert!(matches!(blocked, Err(AuthError::AccountLocked(_))));

    service
        .login(LoginRequest::new("bob", "bob-pw").with_client(owner))
        .await
        .expect("other source should not be locked");
}

#[tokio::test]
async fn test_stolen_token_after_rotation_kills_family() {
    let ctx = setup();
    let login = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();
    let stolen = login.refresh_token.clone();

    ctx.clock.advance(Duration::minutes(1));
    let owner = ctx
        .service
        .refresh(&login.refresh_token, ClientContext::default())
        .await
        .unwrap();

    let attack = ctx.service.refresh(&stolen, ClientContext::default()).await;
    assert!(matches!(attack, Err(AuthError::ReuseDetected)));

    let next = ctx
        .service
        .refresh(&owner.refresh_token, ClientContext::default())
        .await;
    assert!(matches!(next, Err(AuthError::ReuseDetected)));

    let owner_record = ctx
        .store
        .find_by_jti(&refresh_jti(&ctx, &owner.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        owner_record.revocation_reason.as_deref(),
        Some("reuse_detected")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_exactly_one_wins() {
    let ctx = setup();
    let login = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = ctx.service.clone();
        let token = login.refresh_token.clone();
        handles.push(tokio::spawn(async move {
            service.refresh(&token, ClientContext::default()).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(pair) => winners.push(pair),
            Err(e) => assert!(
                matches!(e, AuthError::ReuseDetected),
                "unexpected error: {:?}",
                e
            ),
        }
    }

    assert_eq!(winners.len(), 1);

    // The losers revoked the whole family, including the winner's new token
    let winner = &winners[0];
    let result = ctx
        .service
        .refresh(&winner.refresh_token, ClientContext::default())
        .await;
    assert!(matches!(result, Err(AuthError::ReuseDetected)));
    assert!(matches!(
        ctx.service.verify_access_token(&winner.access_token).await,
        Err(AuthError::TokenRevoked)
    ));
}

#[tokio::test]
async fn test_logout_revokes_access_and_refresh() {
    let ctx = setup();
    let login = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    ctx.service.logout(&login.refresh_token).await.unwrap();

    assert!(matches!(
        ctx.service.verify_access_token(&login.access_token).await,
        Err(AuthError::TokenRevoked)
    ));
    let result = ctx
        .service
        .refresh(&login.refresh_token, ClientContext::default())
        .await;
    assert!(matches!(result, Err(AuthError::ReuseDetected)));
}

#[tokio::test]
async fn test_expired_refresh_token_requires_login() {
    let ctx = setup();
    let login = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    ctx.clock.advance(Duration::days(7) + Duration::seconds(1));
    let result = ctx
        .service
        .refresh(&login.refresh_token, ClientContext::default())
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, AuthError::ExpiredToken));
    assert!(err.requires_reauthentication());
}

#[tokio::test]
async fn test_refresh_records_client_context() {
    let ctx = setup();
    let login = ctx
        .service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    let client = ClientContext {
        ip_address: Some("192.0.2.10".into()),
        user_agent: Some("NovaSocial/2.4 iOS".into()),
        device_fingerprint: Some("device-123".into()),
    };
    let pair = ctx
        .service
        .refresh(&login.refresh_token, client)
        .await
        .unwrap();

    let record = ctx
        .store
        .find_by_jti(&refresh_jti(&ctx, &pair.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.ip_address.as_deref(), Some("192.0.2.10"));
    assert_eq!(record.device_fingerprint.as_deref(), Some("device-123"));

    let old = ctx
        .store
        .find_by_jti(&refresh_jti(&ctx, &login.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.revocation_reason.as_deref(), Some("rotated"));
    assert!(old.last_used_at.is_some());
}

#[tokio::test]
async fn test_custom_lockout_threshold() {
    let clock = ManualClock::default();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let settings = LockoutSettings {
        max_attempts: 2,
        lockout_duration_secs: 60,
        key_includes_ip: false,
    };
    let codec = Arc::new(auth_session::TokenCodec::new(&TokenSettings::new(
        SECRET, SECRET,
    )));
    let service = AuthSessionService::new(
        codec,
        Arc::new(InMemoryRefreshTokenStore::new()),
        Arc::new(auth_session::security::InMemoryRevocationList::new(
            clock_arc.clone(),
        )),
        Arc::new(auth_session::security::InMemoryLockoutGuard::new(
            &settings,
            clock_arc.clone(),
        )),
        Arc::new(
            StaticPrincipalDirectory::new()
                .with_principal("carol", hash_password("carol-pw").unwrap()),
        ),
        Arc::new(Argon2PasswordVerifier),
        clock_arc,
    );

    for _ in 0..2 {
        let _ = service.login(LoginRequest::new("carol", "nope")).await;
    }
    let result = service.login(LoginRequest::new("carol", "carol-pw")).await;
    match result {
        Err(AuthError::AccountLocked(unlock_at)) => {
            assert_eq!(unlock_at, clock.now() + Duration::seconds(60));
        }
        other => panic!("expected AccountLocked, got {:?}", other),
    }
}

#[tokio::test]
async fn test_touch_failure_does_not_block_refresh() {
    let clock = ManualClock::default();
    let store = Arc::new(FlakyStore::default());
    let service = service_over(store.clone(), &clock);
    let login = service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    store.fail("touch");
    let pair = service
        .refresh(&login.refresh_token, ClientContext::default())
        .await
        .expect("refresh should not depend on last_used_at");

    assert!(service.verify_access_token(&pair.access_token).await.is_ok());
}

#[tokio::test]
async fn test_unavailable_lookup_is_not_reported_as_reuse() {
    let clock = ManualClock::default();
    let store = Arc::new(FlakyStore::default());
    let service = service_over(store.clone(), &clock);
    let login = service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();

    store.fail("find_active");
    let result = service
        .refresh(&login.refresh_token, ClientContext::default())
        .await;
    assert!(
        matches!(result, Err(AuthError::StorageUnavailable(_))),
        "got {:?}",
        result
    );

    // Nothing was burned: the same token still refreshes once storage is back
    store.heal();
    service
        .refresh(&login.refresh_token, ClientContext::default())
        .await
        .expect("token should still be active");
}

#[tokio::test]
async fn test_reuse_response_surfaces_storage_failure() {
    let clock = ManualClock::default();
    let store = Arc::new(FlakyStore::default());
    let service = service_over(store.clone(), &clock);
    let login = service
        .login(LoginRequest::new("alice", "correct-pw"))
        .await
        .unwrap();
    let owner = service
        .refresh(&login.refresh_token, ClientContext::default())
        .await
        .unwrap();

    store.fail("revoke_all_for_user");
    let result = service
        .refresh(&login.refresh_token, ClientContext::default())
        .await;
    assert!(
        matches!(result, Err(AuthError::StorageUnavailable(_))),
        "got {:?}",
        result
    );

    store.heal();
    store.fail("find_by_jti");
    let result = service
        .refresh(&login.refresh_token, ClientContext::default())
        .await;
    assert!(
        matches!(result, Err(AuthError::StorageUnavailable(_))),
        "got {:?}",
        result
    );

    // The family revocation never happened, so the owner's token is intact
    store.heal();
    let owner_jti = service
        .codec()
        .verify_ignoring_expiry(&owner.refresh_token, TokenType::Refresh)
        .unwrap()
        .jti
        .unwrap();
    assert!(store
        .find_active(&owner_jti, clock.now())
        .await
        .unwrap()
        .is_some());
}
