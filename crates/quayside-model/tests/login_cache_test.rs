// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the login cache token lifecycle.

mod common;

use chrono::TimeDelta;
use common::{TestClock, create_user, test_pool};
use quayside_model::users::{Identity, LoginCache, TokenLookup, find_user};

#[tokio::test]
async fn test_issue_or_refresh_keeps_token_and_advances_timestamp() {
    let pool = test_pool().await;
    let clock = TestClock::new();
    let cache = LoginCache::new(pool.clone()).with_clock(clock.clock());
    create_user(&pool, "alice").await;

    let first = cache.issue_or_refresh("alice").await.unwrap();
    let issued_at = find_user(&pool, "alice")
        .await
        .unwrap()
        .login_cache
        .unwrap()
        .refreshed_at;

    clock.advance(TimeDelta::minutes(5));
    let second = cache.issue_or_refresh("alice").await.unwrap();
    let refreshed_at = find_user(&pool, "alice")
        .await
        .unwrap()
        .login_cache
        .unwrap()
        .refreshed_at;

    assert_eq!(first, second);
    assert!(refreshed_at > issued_at);
    assert_eq!(refreshed_at - issued_at, TimeDelta::minutes(5));
}

#[tokio::test]
async fn test_lookup_valid_then_expired() {
    let pool = test_pool().await;
    let clock = TestClock::new();
    let cache = LoginCache::new(pool.clone()).with_clock(clock.clock());
    create_user(&pool, "alice").await;

    let token = cache.issue_or_refresh("alice").await.unwrap();
    assert!(matches!(
        cache.lookup(&token).await.unwrap(),
        TokenLookup::Valid(ref user) if user.id == "alice"
    ));

    clock.advance(TimeDelta::minutes(59));
    assert!(matches!(
        cache.lookup(&token).await.unwrap(),
        TokenLookup::Valid(_)
    ));

    clock.advance(TimeDelta::minutes(2));
    match cache.lookup(&token).await.unwrap() {
        TokenLookup::Expired(user) => {
            assert_eq!(user.id, "alice");
            assert_eq!(user.email, "alice@example.com");
        }
        other => panic!("expected Expired, got {:?}", other),
    }

    let (_, valid) = cache.get_user("alice").await.unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn test_lookup_never_issued_token_is_not_found() {
    let pool = test_pool().await;
    let cache = LoginCache::new(pool.clone());
    create_user(&pool, "alice").await;

    assert_eq!(
        cache.lookup("deadbeef").await.unwrap(),
        TokenLookup::NotFound
    );
}

#[tokio::test]
async fn test_clear_all_invalidates_every_token() {
    let pool = test_pool().await;
    let cache = LoginCache::new(pool.clone());
    create_user(&pool, "alice").await;
    create_user(&pool, "bob").await;

    let alice = cache.issue_or_refresh("alice").await.unwrap();
    let bob = cache.issue_or_refresh("bob").await.unwrap();
    assert_ne!(alice, bob);

    assert_eq!(cache.clear_all().await.unwrap(), 2);
    assert_eq!(cache.lookup(&alice).await.unwrap(), TokenLookup::NotFound);
    assert_eq!(cache.lookup(&bob).await.unwrap(), TokenLookup::NotFound);
}

#[tokio::test]
async fn test_clear_then_issue_generates_new_token() {
    let pool = test_pool().await;
    let cache = LoginCache::new(pool.clone());
    create_user(&pool, "alice").await;

    let before = cache.issue_or_refresh("alice").await.unwrap();
    cache.clear("alice").await.unwrap();
    assert_eq!(cache.lookup(&before).await.unwrap(), TokenLookup::NotFound);
    assert!(find_user(&pool, "alice").await.unwrap().login_cache.is_none());

    let after = cache.issue_or_refresh("alice").await.unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn test_get_or_create_never_overwrites() {
    let pool = test_pool().await;
    let cache = LoginCache::new(pool.clone());

    let identity = Identity {
        id: "carol".to_string(),
        display_name: "Carol".to_string(),
        email: "carol@example.com".to_string(),
        roles: vec!["admin".to_string()],
    };

    let created = cache.get_or_create(&identity).await.unwrap();
    assert_eq!(created.display_name, "Carol");
    assert_eq!(created.roles, vec!["admin".to_string()]);
    let token = created.login_cache.clone().unwrap().token;
    assert!(matches!(
        cache.lookup(&token).await.unwrap(),
        TokenLookup::Valid(_)
    ));

    let changed = Identity {
        display_name: "Someone Else".to_string(),
        roles: vec![],
        ..identity
    };
    let again = cache.get_or_create(&changed).await.unwrap();
    assert_eq!(again.display_name, "Carol");
    assert_eq!(again.roles, vec!["admin".to_string()]);
    assert_eq!(again.login_cache.unwrap().token, token);
}
