// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for quayside-model tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use quayside_model::users::{Clock, User, save_user};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// Fresh in-memory database with all model migrations applied.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test pool");
    quayside_model::migrations::run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Manually advanced clock.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }

    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Store a user without a login token.
pub async fn create_user(pool: &SqlitePool, id: &str) -> User {
    let user = User {
        id: id.to_string(),
        display_name: format!("User {}", id),
        email: format!("{}@example.com", id),
        created_at: Utc::now(),
        api_key: String::new(),
        roles: vec!["builder".to_string()],
        login_cache: None,
    };
    save_user(pool, &user).await.expect("Failed to save user");
    user
}
