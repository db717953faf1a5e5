// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for quayside-model.

use thiserror::Error;

/// Model errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A record that was expected to exist is missing.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Kind of record (user, settings, bucket, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A write did not affect the expected number of rows.
    #[error("Persistence error during '{operation}': {details}")]
    Persistence {
        /// The write operation that misbehaved.
        operation: &'static str,
        /// What was expected versus what happened.
        details: String,
    },

    /// The settings document is malformed or incomplete.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Credentials or token were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn unexpected_rows(operation: &'static str, expected: u64, actual: u64) -> Self {
        Self::Persistence {
            operation,
            details: format!("expected {} affected row(s), got {}", expected, actual),
        }
    }

    /// Whether this error is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type using ModelError.
pub type Result<T> = std::result::Result<T, ModelError>;
