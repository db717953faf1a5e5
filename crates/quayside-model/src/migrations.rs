// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for quayside-model.
//!
//! Exposes the embedded SQLite migrations for the settings document and user
//! tables. quayside-environment merges these with its own queue migrations.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use quayside_model::migrations;
//!
//! let pool = SqlitePool::connect("sqlite::memory:").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all model migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
