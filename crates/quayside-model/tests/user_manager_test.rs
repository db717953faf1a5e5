// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for user manager selection and the directory-backed flow.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::test_pool;
use quayside_model::auth::{DirectoryClient, UserManager};
use quayside_model::error::{ModelError, Result};
use quayside_model::settings::{ServiceSettings, StaticUser};
use quayside_model::users::Identity;

struct FakeDirectory;

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity> {
        if password != "correct" {
            return Err(ModelError::Authentication("bad password".to_string()));
        }
        Ok(Identity {
            id: username.to_string(),
            display_name: username.to_uppercase(),
            email: format!("{}@corp.example", username),
            roles: vec!["builder".to_string()],
        })
    }
}

#[tokio::test]
async fn test_no_auth_configured() {
    let pool = test_pool().await;
    let settings = ServiceSettings::default();
    assert!(UserManager::from_settings(&settings, pool, None).unwrap().is_none());
}

#[tokio::test]
async fn test_directory_requires_client() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings::default();
    settings.directory.url = "ldaps://directory.example".to_string();

    let err = UserManager::from_settings(&settings, pool, None).unwrap_err();
    assert!(matches!(err, ModelError::InvalidSettings(_)));
}

#[tokio::test]
async fn test_directory_wins_over_static() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings::default();
    settings.directory.url = "ldaps://directory.example".to_string();
    settings.static_auth.enabled = true;

    let manager = UserManager::from_settings(&settings, pool, Some(Arc::new(FakeDirectory)))
        .unwrap()
        .unwrap();
    assert!(matches!(manager, UserManager::Directory(_)));
}

#[tokio::test]
async fn test_directory_token_flow() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings::default();
    settings.directory.url = "ldaps://directory.example".to_string();
    let manager = UserManager::from_settings(&settings, pool, Some(Arc::new(FakeDirectory)))
        .unwrap()
        .unwrap();

    assert!(manager.create_user_token("dave", "wrong").await.is_err());

    let token = manager.create_user_token("dave", "correct").await.unwrap();
    let again = manager.create_user_token("dave", "correct").await.unwrap();
    assert_eq!(token, again);

    let identity = manager.user_by_token(&token).await.unwrap();
    assert_eq!(identity.id, "dave");
    assert_eq!(identity.display_name, "DAVE");

    let err = manager.user_by_token("not-a-token").await.unwrap_err();
    assert!(matches!(err, ModelError::Authentication(_)));
}

#[tokio::test]
async fn test_static_manager_selected() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings::default();
    settings.static_auth.enabled = true;
    settings.static_auth.users.push(StaticUser {
        id: "ops".to_string(),
        password: "secret".to_string(),
        ..Default::default()
    });

    let manager = UserManager::from_settings(&settings, pool, None)
        .unwrap()
        .unwrap();
    let token = manager.create_user_token("ops", "secret").await.unwrap();
    assert_eq!(manager.user_by_token(&token).await.unwrap().id, "ops");
}
