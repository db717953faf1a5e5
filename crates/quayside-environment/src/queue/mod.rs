// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queues.
//!
//! Three queue flavours share one job model ([`JobRecord`]) and one handler
//! registry ([`JobRegistry`]):
//!
//! | Queue | Storage | Purpose |
//! |-------|---------|---------|
//! | [`LocalQueue`] | memory, bounded | maintenance jobs of this process |
//! | [`DurableQueue`] | `queue_jobs` table | submitted work, survives restarts |
//! | [`QueueGroup`] | `queue_jobs` table | lazily created named durable queues |

mod durable;
mod group;
mod job;
mod local;

pub use durable::{DurableQueue, DurableQueueOptions};
pub use group::{QueueGroup, QueueGroupOptions};
pub use job::{FnJobHandler, JobHandler, JobRecord, JobRegistry, JobStatus, QueueStats};
pub use local::LocalQueue;

use thiserror::Error;

/// Queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A job with this id is already queued.
    #[error("Job '{0}' already exists")]
    Duplicate(String),

    /// No job with this id.
    #[error("Job '{0}' not found")]
    NotFound(String),

    /// The queue no longer accepts work.
    #[error("Queue '{0}' is closed")]
    Closed(String),

    /// Workers did not stop before the deadline.
    #[error("Queue '{0}' did not stop before the deadline")]
    CloseTimeout(String),

    /// A write did not affect the expected number of rows.
    #[error("Persistence error during '{operation}': {details}")]
    Persistence {
        /// The write that misbehaved.
        operation: &'static str,
        /// What was expected versus what happened.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
