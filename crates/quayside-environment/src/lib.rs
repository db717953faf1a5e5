// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quayside Environment - shared resources and their lifecycle
//!
//! An [`Environment`] owns every long-lived resource of a quayside process
//! and the closers that tear them down:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  CLI / crons ──►│          Environment         │◄── job handlers
//!                 │  db · local queue · durable  │
//!                 │  queue · queue group ·       │
//!                 │  process manager · root token│
//!                 │  closer registry             │
//!                 └──────────────┬───────────────┘
//!                                │ close(ctx)
//!                                ▼
//!                   closers run concurrently,
//!                   failures are aggregated
//! ```
//!
//! # Initialization
//!
//! [`Environment::initialize`] validates the [`Config`] and then opens the
//! database, builds the local queue, the durable queue, the queue group, the
//! process manager and the root cancellation token, in that order. Each step
//! registers its closer before the next one starts. A failing step aborts
//! initialization and runs the closers registered so far.
//!
//! # Shutdown
//!
//! [`Environment::close`] launches every closer on its own task, background
//! or not, and waits until all have returned or the [`ShutdownContext`]
//! deadline passes. Every failure is reported in one [`ShutdownError`].
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QUAYSIDE_DATABASE_URL` | `sqlite:quayside.db?mode=rwc` | SQLite database |
//! | `QUAYSIDE_NUM_WORKERS` | `2` | Worker tasks per queue |
//! | `QUAYSIDE_QUEUE_NAME` | `quayside.service` | Durable queue name and group prefix |
//! | `QUAYSIDE_SHUTDOWN_TIMEOUT_SECS` | `30` | Deadline of `close` |
//!
//! See [`config::Config::from_env`] for the full list.

#![warn(missing_docs)]

/// Closers and the shutdown context.
pub mod closer;

/// Configuration loaded from environment variables.
pub mod config;

/// Recurring maintenance jobs.
pub mod crons;

/// The environment aggregate.
pub mod environment;

/// Error types.
pub mod error;

/// Process-wide current environment.
pub mod global;

/// Job submission and status.
pub mod jobs;

/// Embedded database migrations.
pub mod migrations;

/// Child process tracking.
pub mod process;

/// Local and durable job queues.
pub mod queue;

/// Ordered initialization.
pub mod sequencer;

pub use closer::{Closer, ShutdownContext};
pub use config::Config;
pub use environment::Environment;
pub use error::{CloserFailure, Error, Result, ShutdownError};
pub use global::{environment, set_environment, take_environment};
