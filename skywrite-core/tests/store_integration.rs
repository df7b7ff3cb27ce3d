//! Repository integration tests. These need a live PostgreSQL (sqlx's test
//! harness provisions a throwaway database per test from `DATABASE_URL`),
//! so they are ignored by default; run with
//! `cargo test -p skywrite-core -- --ignored` against a reachable server.

use chrono::Utc;
use sqlx::PgPool;

use skywrite_core::auth::DpopKey;
use skywrite_core::crypto::TokenCipher;
use skywrite_core::error::Error;
use skywrite_core::store::{NewSession, PostRepository, TokenStore, UserRepository};
use skywrite_model::{NewPost, PostStatus, RevokeReason, User};

const SECRET: &str = "0123456789abcdef0123456789abcdef";

fn token_store(pool: &PgPool) -> TokenStore {
    TokenStore::new(pool.clone(), TokenCipher::from_secret(SECRET).unwrap())
}

async fn seed_user(pool: &PgPool) -> User {
    UserRepository::new(pool.clone())
        .upsert_by_did("did:plc:alice123", "alice.bsky.social", None)
        .await
        .unwrap()
}

fn new_session(user: &User) -> NewSession {
    let now = Utc::now();
    NewSession {
        user_id: user.id,
        access_token: "access-plain".to_string(),
        refresh_token: "refresh-plain".to_string(),
        dpop_key: DpopKey::generate(),
        access_expires_at: now + chrono::Duration::hours(1),
        refresh_expires_at: now + chrono::Duration::days(90),
        user_agent: Some("test-agent".to_string()),
        source_ip: None,
    }
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn put_then_get_returns_the_input_material(pool: PgPool) {
    let user = seed_user(&pool).await;
    let store = token_store(&pool);

    let new = new_session(&user);
    let thumbprint = new.dpop_key.thumbprint();
    let session_id = store.put(new).await.unwrap();

    let opened = store.get(session_id).await.unwrap();
    assert_eq!(opened.access_token.as_str(), "access-plain");
    assert_eq!(opened.refresh_token.as_str(), "refresh-plain");
    assert_eq!(opened.dpop_thumbprint, thumbprint);
    assert_eq!(opened.dpop_key.thumbprint(), thumbprint);
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn rotation_replaces_material_and_old_tokens_are_gone(pool: PgPool) {
    let user = seed_user(&pool).await;
    let store = token_store(&pool);
    let session_id = store.put(new_session(&user)).await.unwrap();

    let now = Utc::now();
    let new_key = DpopKey::generate();
    store
        .rotate(
            session_id,
            "access-2",
            "refresh-2",
            now + chrono::Duration::hours(1),
            now + chrono::Duration::days(90),
            Some(&new_key),
        )
        .await
        .unwrap();

    let opened = store.get(session_id).await.unwrap();
    assert_eq!(opened.access_token.as_str(), "access-2");
    assert_eq!(opened.refresh_token.as_str(), "refresh-2");
    assert_eq!(opened.dpop_thumbprint, new_key.thumbprint());
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn revoke_is_idempotent(pool: PgPool) {
    let user = seed_user(&pool).await;
    let store = token_store(&pool);
    let session_id = store.put(new_session(&user)).await.unwrap();

    store
        .revoke(session_id, RevokeReason::Logout)
        .await
        .unwrap();
    store
        .revoke(session_id, RevokeReason::RefreshRejected)
        .await
        .unwrap();

    let meta = store.peek(session_id).await.unwrap();
    assert!(!meta.is_active);
    assert!(matches!(
        store.get(session_id).await,
        Err(Error::SessionExpired)
    ));
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn claim_cas_admits_exactly_one_winner(pool: PgPool) {
    let user = seed_user(&pool).await;
    let posts = PostRepository::new(pool.clone());
    let post = posts
        .insert(&NewPost::standalone(
            user.id,
            "race me".to_string(),
            Utc::now() - chrono::Duration::seconds(1),
        ))
        .await
        .unwrap();

    let first = posts.claim(post.id).await.unwrap();
    let second = posts.claim(post.id).await.unwrap();
    assert!(first);
    assert!(!second);

    let row = posts.get(post.id).await.unwrap().unwrap();
    assert_eq!(row.status, PostStatus::Executing);
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn due_batch_skips_future_held_and_disabled_posts(pool: PgPool) {
    let user = seed_user(&pool).await;
    let posts = PostRepository::new(pool.clone());
    let past = Utc::now() - chrono::Duration::minutes(1);

    let due = posts
        .insert(&NewPost::standalone(user.id, "due".to_string(), past))
        .await
        .unwrap();
    posts
        .insert(&NewPost::standalone(
            user.id,
            "future".to_string(),
            Utc::now() + chrono::Duration::hours(1),
        ))
        .await
        .unwrap();
    let mut held = NewPost::standalone(user.id, "held".to_string(), past);
    held.can_execute = false;
    posts.insert(&held).await.unwrap();

    let batch = posts.due_batch(100).await.unwrap();
    let ids: Vec<_> = batch.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![due.id]);
}

#[ignore = "requires a live PostgreSQL"]
#[sqlx::test(migrations = "./migrations")]
async fn terminal_failure_writes_a_failure_record(pool: PgPool) {
    let user = seed_user(&pool).await;
    let posts = PostRepository::new(pool.clone());
    let post = posts
        .insert(&NewPost::standalone(
            user.id,
            "doomed".to_string(),
            Utc::now() - chrono::Duration::seconds(1),
        ))
        .await
        .unwrap();

    assert!(posts.claim(post.id).await.unwrap());
    posts
        .mark_failed(post.id, "permanent failure: 400", Some(3))
        .await
        .unwrap();

    let row = posts.get(post.id).await.unwrap().unwrap();
    assert_eq!(row.status, PostStatus::Failed);
    assert_eq!(row.retry_count, 3);

    let failures = posts.failure_records_for(post.id).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("400"));
}
