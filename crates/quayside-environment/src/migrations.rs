// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for quayside-environment.
//!
//! The environment adds the durable queue table on top of quayside-model's
//! settings and users tables. [`run`] applies both sets as one migrator,
//! sorted by version.

use std::borrow::Cow;

use sqlx::migrate::{MigrateError, Migration, Migrator};

/// Queue migrations, versioned after the model migrations (0001, 0002, ...).
static QUEUE_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug)]
struct CombinedMigrations;

impl<'s> sqlx::migrate::MigrationSource<'s> for CombinedMigrations {
    fn resolve(
        self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Vec<Migration>, Box<dyn std::error::Error + Send + Sync>>,
                > + Send
                + 's,
        >,
    > {
        Box::pin(async move { Ok(iter().map(Cow::into_owned).collect()) })
    }
}

/// Migrator holding model and queue migrations.
pub async fn migrator() -> Result<Migrator, MigrateError> {
    Migrator::new(CombinedMigrations).await
}

/// Run all migrations. Already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    migrator().await?.run(pool).await
}

/// All migrations, sorted by version.
pub fn iter() -> impl Iterator<Item = Cow<'static, Migration>> {
    let model = quayside_model::migrations::SQLITE.iter().map(Cow::Borrowed);
    let queue = QUEUE_MIGRATOR.iter().map(Cow::Borrowed);

    let mut all: Vec<_> = model.chain(queue).collect();
    all.sort_by_key(|m| m.version);
    all.into_iter()
}
