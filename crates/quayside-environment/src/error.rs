// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for quayside-environment.

use thiserror::Error;

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// An initialization step failed; startup was aborted.
    #[error("Failed to initialize {step}: {source}")]
    ResourceInit {
        /// The step that failed.
        step: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// One or more closers failed during shutdown.
    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    /// Process manager operation failed.
    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),

    /// Settings, flags or users operation failed.
    #[error("Model error: {0}")]
    Model(#[from] quayside_model::ModelError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job was not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job submission is turned off by a feature flag.
    #[error("Job submission is disabled")]
    SubmissionDisabled,

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No environment has been installed for this process.
    #[error("No environment is installed")]
    NoEnvironment,
}

impl Error {
    pub(crate) fn resource_init(step: &'static str, source: anyhow::Error) -> Self {
        Self::ResourceInit {
            step,
            source: source.into(),
        }
    }
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A closer that returned an error, panicked, or missed the deadline.
#[derive(Debug, Error)]
#[error("closer '{name}' failed: {error}")]
pub struct CloserFailure {
    /// Name the closer was registered under.
    pub name: String,
    /// What went wrong.
    pub error: anyhow::Error,
}

/// Every closer failure of one shutdown.
#[derive(Debug, Error)]
#[error("{}", describe(.failures))]
pub struct ShutdownError {
    failures: Vec<CloserFailure>,
}

fn describe(failures: &[CloserFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ShutdownError {
    pub(crate) fn new(failures: Vec<CloserFailure>) -> Self {
        Self { failures }
    }

    /// Individual failures, in completion order.
    pub fn failures(&self) -> &[CloserFailure] {
        &self.failures
    }

    /// Names of the failing closers.
    pub fn failed_closers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_names_every_closer() {
        let err = ShutdownError::new(vec![
            CloserFailure {
                name: "disconnect-db-client".to_string(),
                error: anyhow::anyhow!("pool busy"),
            },
            CloserFailure {
                name: "local-queue".to_string(),
                error: anyhow::anyhow!("jobs running"),
            },
        ]);

        assert_eq!(
            err.to_string(),
            "closer 'disconnect-db-client' failed: pool busy; closer 'local-queue' failed: jobs running"
        );
        assert_eq!(err.failed_closers(), vec!["disconnect-db-client", "local-queue"]);
    }

    #[test]
    fn test_resource_init_display() {
        let err = Error::resource_init("database", anyhow::anyhow!("unable to open database file"));
        assert_eq!(
            err.to_string(),
            "Failed to initialize database: unable to open database file"
        );
    }
}
