/// PostgreSQL refresh token store tests
///
/// Need a reachable database in DATABASE_URL; each test returns early when it
/// is not set.
use auth_session::db::{PgRefreshTokenStore, RefreshTokenStore, StoreCallPolicy};
use auth_session::error::AuthError;
use auth_session::models::{hash_token, NewRefreshToken, RevocationReason};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use uuid::Uuid;

async fn test_store() -> Option<PgRefreshTokenStore> {
    dotenvy::dotenv().ok();

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL store test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to create test database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(PgRefreshTokenStore::new(pool, StoreCallPolicy::default()))
}

fn new_token(user_id: Uuid, now: DateTime<Utc>) -> NewRefreshToken {
    let jti = Uuid::new_v4().to_string();
    NewRefreshToken {
        user_id,
        token_hash: hash_token(&jti),
        jti,
        expires_at: now + Duration::days(7),
        ip_address: Some("10.1.2.3".into()),
        user_agent: Some("integration-test".into()),
        device_fingerprint: None,
    }
}

#[tokio::test]
async fn test_issue_and_find_active() {
    let Some(store) = test_store().await else {
        return;
    };
    let now = Utc::now();
    let new = new_token(Uuid::new_v4(), now);
    let jti = new.jti.clone();

    let record = store.issue(new.clone(), now).await.unwrap();
    assert_eq!(record.jti, jti);
    assert!(!record.is_revoked);

    assert!(store.find_active(&jti, now).await.unwrap().is_some());
    assert!(store
        .find_active(&jti, now + Duration::days(8))
        .await
        .unwrap()
        .is_none());

    let duplicate = store.issue(new, now).await;
    assert!(matches!(duplicate, Err(AuthError::DuplicateJti)));
}

#[tokio::test]
async fn test_rotate_is_exactly_once_under_concurrency() {
    let Some(store) = test_store().await else {
        return;
    };
    let store = Arc::new(store);
    let now = Utc::now();
    let user_id = Uuid::new_v4();
    let old = store.issue(new_token(user_id, now), now).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let old_jti = old.jti.clone();
        handles.push(tokio::spawn(async move {
            store
                .rotate(&old_jti, new_token(user_id, now), RevocationReason::Rotated, now)
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(matches!(e, AuthError::ReuseDetected), "got {:?}", e),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(store.list_active_for_user(user_id, now).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rotate_retry_after_commit_is_idempotent() {
    let Some(store) = test_store().await else {
        return;
    };
    let now = Utc::now();
    let user_id = Uuid::new_v4();
    let old = store.issue(new_token(user_id, now), now).await.unwrap();
    let successor = new_token(user_id, now);

    let first = store
        .rotate(&old.jti, successor.clone(), RevocationReason::Rotated, now)
        .await
        .unwrap();
    let retried = store
        .rotate(&old.jti, successor, RevocationReason::Rotated, now)
        .await
        .unwrap();

    assert_eq!(first.id, retried.id);
}

#[tokio::test]
async fn test_failed_insert_keeps_old_token_active() {
    let Some(store) = test_store().await else {
        return;
    };
    let now = Utc::now();
    let user_id = Uuid::new_v4();
    let old = store.issue(new_token(user_id, now), now).await.unwrap();
    let taken = store.issue(new_token(user_id, now), now).await.unwrap();

    let mut colliding = new_token(user_id, now);
    colliding.jti = taken.jti.clone();

    let result = store
        .rotate(&old.jti, colliding, RevocationReason::Rotated, now)
        .await;

    assert!(matches!(result, Err(AuthError::DuplicateJti)));
    assert!(store.find_active(&old.jti, now).await.unwrap().is_some());
}

#[tokio::test]
async fn test_revoke_all_and_purge() {
    let Some(store) = test_store().await else {
        return;
    };
    let now = Utc::now();
    let user_id = Uuid::new_v4();
    let a = store.issue(new_token(user_id, now), now).await.unwrap();
    store.issue(new_token(user_id, now), now).await.unwrap();

    assert!(store.revoke(&a.jti, RevocationReason::Logout, now).await.unwrap());
    assert!(!store.revoke(&a.jti, RevocationReason::Logout, now).await.unwrap());

    let revoked = store
        .revoke_all_for_user(user_id, RevocationReason::PasswordChange, now)
        .await
        .unwrap();
    assert_eq!(revoked.len(), 1);
    assert!(store.list_active_for_user(user_id, now).await.unwrap().is_empty());

    store.touch(&a.jti, now).await.unwrap();

    let mut stale = new_token(user_id, now);
    stale.expires_at = now - Duration::days(200);
    let stale = store.issue(stale, now).await.unwrap();

    let purged = store.purge_expired(now - Duration::days(100)).await.unwrap();
    assert!(purged >= 1);
    assert!(store.find_by_jti(&stale.jti).await.unwrap().is_none());
    assert!(store.find_by_jti(&a.jti).await.unwrap().is_some());
}
