// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the settings document and feature flag persistence.

mod common;

use common::test_pool;
use quayside_model::error::ModelError;
use quayside_model::flags::{FeatureFlag, FeatureFlags};
use quayside_model::settings::{SETTINGS_ID, ServiceSettings};

#[tokio::test]
async fn test_find_or_create_creates_default_once() {
    let pool = test_pool().await;

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM service_settings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);

    let first = ServiceSettings::find_or_create(&pool).await.unwrap();
    assert_eq!(first.id, SETTINGS_ID);
    assert_eq!(first.flags, FeatureFlags::default());
    for flag in FeatureFlag::ALL {
        assert!(!first.flags.get(flag));
    }

    let second = ServiceSettings::find_or_create(&pool).await.unwrap();
    assert_eq!(first, second);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM service_settings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

#[tokio::test]
async fn test_save_rejects_foreign_id() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings {
        id: "something-else".to_string(),
        ..Default::default()
    };
    let err = settings.save(&pool).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidSettings(_)));

    settings.id = String::new();
    settings.save(&pool).await.unwrap();
    assert_eq!(settings.id, SETTINGS_ID);
}

#[tokio::test]
async fn test_persist_flag_updates_only_that_key() {
    let pool = test_pool().await;
    let mut settings = ServiceSettings::find_or_create(&pool).await.unwrap();
    settings.artifacts.path = "/srv/artifacts".to_string();
    settings.save(&pool).await.unwrap();

    let mut flags = settings.flags;
    flags
        .persist(&pool, FeatureFlag::DisableJobSubmission, true)
        .await
        .unwrap();
    assert!(flags.get(FeatureFlag::DisableJobSubmission));

    let reloaded = ServiceSettings::find_or_create(&pool).await.unwrap();
    assert!(reloaded.flags.disable_job_submission);
    assert!(!reloaded.flags.disable_job_execution);
    assert_eq!(reloaded.artifacts.path, "/srv/artifacts");
}

#[tokio::test]
async fn test_persist_flag_without_document_is_not_found() {
    let pool = test_pool().await;
    let mut flags = FeatureFlags::default();

    let err = flags
        .persist(&pool, FeatureFlag::DisableJobExecution, true)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!flags.get(FeatureFlag::DisableJobExecution));
}
